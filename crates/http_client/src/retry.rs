//! Retry policy for the request pipeline.

use std::{
    cmp,
    collections::HashSet,
    time::Duration,
};

use common::Error;
use rand::Rng;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        let jitter = 0.5 + rng.gen::<f64>();
        cmp::min(backoff, self.max_backoff).mul_f64(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Response statuses worth another attempt. `None` means the default
    /// set: every 5xx except 501.
    pub retry_statuses: Option<HashSet<u16>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            retry_statuses: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        match &self.retry_statuses {
            Some(statuses) => statuses.contains(&status),
            None => status >= 500 && status != 501,
        }
    }

    pub fn is_retryable_error(&self, error: &Error) -> bool {
        error.is_retryable()
    }
}
