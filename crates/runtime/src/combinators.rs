//! Promise combinators.
//!
//! `all`, `race`, `any`, and `all_settled` operate purely on subscriptions.
//! `concurrent` takes task factories, never pre-started promises, so the
//! "at most `limit` in flight" contract is enforceable. `timeout`, `retry`,
//! and `delay` need a [`LoopHandle`] for their timers.

use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    Error,
    ErrorKind,
    Result,
};
use parking_lot::Mutex;
use rand::Rng;

use crate::{
    event_loop::LoopHandle,
    promise::{
        Promise,
        Resolver,
    },
};

/// Resolves with the ordered results once every input resolves; rejects on
/// the first rejection. Siblings are not cancelled.
pub fn all<T: Send + Clone + 'static>(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
    let (out, resolver) = Promise::pending();
    let len = promises.len();
    if len == 0 {
        resolver.resolve(Vec::new());
        return out;
    }
    let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; len]));
    let remaining = Arc::new(Mutex::new(len));
    for (index, promise) in promises.into_iter().enumerate() {
        let results = results.clone();
        let remaining = remaining.clone();
        let resolver = resolver.clone();
        promise.subscribe(move |result| match result {
            Ok(value) => {
                results.lock()[index] = Some(value);
                let mut remaining = remaining.lock();
                *remaining -= 1;
                if *remaining == 0 {
                    let values = results
                        .lock()
                        .iter_mut()
                        .map(|slot| slot.take().expect("missing result for resolved input"))
                        .collect();
                    resolver.resolve(values);
                }
            },
            Err(e) => resolver.reject(e),
        });
    }
    out
}

/// Mirrors the first promise to settle, fulfillment or rejection.
pub fn race<T: Send + Clone + 'static>(promises: Vec<Promise<T>>) -> Promise<T> {
    let (out, resolver) = Promise::pending();
    if promises.is_empty() {
        resolver.reject(Error::usage("race() requires at least one promise"));
        return out;
    }
    for promise in promises {
        let resolver = resolver.clone();
        promise.subscribe(move |result| resolver.settle(result));
    }
    out
}

/// Resolves with the first fulfillment; rejects with an aggregate error if
/// every input rejects.
pub fn any<T: Send + Clone + 'static>(promises: Vec<Promise<T>>) -> Promise<T> {
    let (out, resolver) = Promise::pending();
    let len = promises.len();
    if len == 0 {
        resolver.reject(Error::usage("any() requires at least one promise"));
        return out;
    }
    let errors: Arc<Mutex<Vec<Option<Error>>>> = Arc::new(Mutex::new(vec![None; len]));
    let remaining = Arc::new(Mutex::new(len));
    for (index, promise) in promises.into_iter().enumerate() {
        let errors = errors.clone();
        let remaining = remaining.clone();
        let resolver = resolver.clone();
        promise.subscribe(move |result| match result {
            Ok(value) => resolver.resolve(value),
            Err(e) => {
                errors.lock()[index] = Some(e);
                let mut remaining = remaining.lock();
                *remaining -= 1;
                if *remaining == 0 {
                    let summary = errors
                        .lock()
                        .iter()
                        .flatten()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; ");
                    resolver.reject(Error::new(
                        ErrorKind::Usage,
                        format!("all {len} promises rejected: {summary}"),
                    ));
                }
            },
        });
    }
    out
}

/// Always resolves, with the ordered settlement of every input.
pub fn all_settled<T: Send + Clone + 'static>(
    promises: Vec<Promise<T>>,
) -> Promise<Vec<Result<T>>> {
    let (out, resolver) = Promise::pending();
    let len = promises.len();
    if len == 0 {
        resolver.resolve(Vec::new());
        return out;
    }
    let results: Arc<Mutex<Vec<Option<Result<T>>>>> = Arc::new(Mutex::new(vec![None; len]));
    let remaining = Arc::new(Mutex::new(len));
    for (index, promise) in promises.into_iter().enumerate() {
        let results = results.clone();
        let remaining = remaining.clone();
        let resolver = resolver.clone();
        promise.subscribe(move |result| {
            results.lock()[index] = Some(result);
            let mut remaining = remaining.lock();
            *remaining -= 1;
            if *remaining == 0 {
                let settled = results
                    .lock()
                    .iter_mut()
                    .map(|slot| slot.take().expect("missing settlement"))
                    .collect();
                resolver.resolve(settled);
            }
        });
    }
    out
}

pub type TaskFactory<T> = Box<dyn FnOnce() -> Promise<T> + Send>;

#[derive(Clone, Copy, Default)]
pub struct ConcurrentOptions {
    /// Reject the whole batch on the first error and cancel whatever is in
    /// flight, instead of capturing per-index errors.
    pub fail_fast: bool,
}

struct ConcurrentState<T> {
    factories: Vec<Option<TaskFactory<T>>>,
    results: Vec<Option<Result<T>>>,
    in_flight: Vec<Promise<T>>,
    next_index: usize,
    running: usize,
    done: usize,
    failed: bool,
}

/// Run at most `limit` tasks at a time, starting them in input order.
/// Results preserve input indices; a task's rejection is captured as that
/// index's error without halting the others unless `fail_fast` is set.
pub fn concurrent<T: Send + Clone + 'static>(
    factories: Vec<TaskFactory<T>>,
    limit: usize,
    options: ConcurrentOptions,
) -> Promise<Vec<Result<T>>> {
    let (out, resolver) = Promise::pending();
    if limit == 0 {
        resolver.reject(Error::usage("concurrent() requires a limit of at least 1"));
        return out;
    }
    let len = factories.len();
    if len == 0 {
        resolver.resolve(Vec::new());
        return out;
    }
    let state = Arc::new(Mutex::new(ConcurrentState {
        factories: factories.into_iter().map(Some).collect(),
        results: (0..len).map(|_| None).collect(),
        in_flight: Vec::new(),
        next_index: 0,
        running: 0,
        done: 0,
        failed: false,
    }));
    pump_concurrent(state, limit, options, resolver);
    out
}

fn pump_concurrent<T: Send + Clone + 'static>(
    state: Arc<Mutex<ConcurrentState<T>>>,
    limit: usize,
    options: ConcurrentOptions,
    resolver: Resolver<Vec<Result<T>>>,
) {
    loop {
        let (index, factory) = {
            let mut guard = state.lock();
            if guard.failed {
                return;
            }
            if guard.done == guard.results.len() {
                let results = guard
                    .results
                    .iter_mut()
                    .map(|slot| slot.take().expect("missing task result"))
                    .collect();
                resolver.resolve(results);
                return;
            }
            if guard.running >= limit || guard.next_index >= guard.factories.len() {
                return;
            }
            let index = guard.next_index;
            guard.next_index += 1;
            guard.running += 1;
            let factory = guard.factories[index].take().expect("factory started twice");
            (index, factory)
        };
        let promise = factory();
        state.lock().in_flight.push(promise.clone());
        let state = state.clone();
        let resolver = resolver.clone();
        promise.subscribe(move |result| {
            {
                let mut guard = state.lock();
                guard.running -= 1;
                guard.done += 1;
                if options.fail_fast {
                    if let Err(e) = &result {
                        guard.failed = true;
                        let in_flight = std::mem::take(&mut guard.in_flight);
                        drop(guard);
                        for sibling in in_flight {
                            sibling.cancel();
                        }
                        resolver.reject(e.clone());
                        return;
                    }
                }
                guard.results[index] = Some(result);
            }
            pump_concurrent(state, limit, options, resolver);
        });
    }
}

/// Resolve after `duration`. Cancelling the promise removes the timer.
pub fn delay(handle: &LoopHandle, duration: Duration) -> Promise<()> {
    let (promise, resolver) = Promise::pending();
    let timer = handle.schedule_after(duration, move || resolver.resolve(()));
    let handle = handle.clone();
    promise.on_cancel(move || {
        handle.cancel_timer(timer);
    });
    promise
}

/// Mirror `p` if it settles within `duration`; otherwise reject with
/// Timeout and cancel `p`.
pub fn timeout<T: Send + Clone + 'static>(
    handle: &LoopHandle,
    promise: Promise<T>,
    duration: Duration,
) -> Promise<T> {
    let (out, resolver) = Promise::pending();
    let deadline_resolver = resolver.clone();
    let work = promise.clone();
    let timer = handle.schedule_after(duration, move || {
        deadline_resolver.reject(Error::timeout(format!(
            "operation exceeded {duration:?}"
        )));
        work.cancel();
    });
    let handle = handle.clone();
    promise.subscribe(move |result| {
        handle.cancel_timer(timer);
        resolver.settle(result);
    });
    out
}

pub type RetryPredicate = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
    /// Defaults to [`Error::is_retryable`].
    pub retryable: Option<RetryPredicate>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            jitter: true,
            retryable: None,
        }
    }
}

impl RetryOptions {
    /// Delay before the attempt after `attempt` (1-based) failed:
    /// `base_delay * 2^(attempt-1)`, jittered into `[0.5, 1.5)` of itself.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let backoff = self.base_delay.checked_mul(exp).unwrap_or(Duration::MAX);
        if self.jitter {
            let factor = 0.5 + rand::thread_rng().gen::<f64>();
            backoff.mul_f64(factor)
        } else {
            backoff
        }
    }

    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        match &self.retryable {
            Some(predicate) => predicate(error, attempt),
            None => error.is_retryable(),
        }
    }
}

/// Invoke `factory` and, on a retryable rejection, schedule the next
/// attempt with exponential backoff until `max_attempts` is exhausted.
pub fn retry<T, F>(handle: &LoopHandle, factory: F, options: RetryOptions) -> Promise<T>
where
    T: Send + Clone + 'static,
    F: Fn() -> Promise<T> + Send + Sync + 'static,
{
    let (out, resolver) = Promise::pending();
    if options.max_attempts == 0 {
        resolver.reject(Error::usage("retry() requires at least one attempt"));
        return out;
    }
    attempt(handle.clone(), Arc::new(factory), options, resolver, 1);
    out
}

fn attempt<T: Send + Clone + 'static>(
    handle: LoopHandle,
    factory: Arc<dyn Fn() -> Promise<T> + Send + Sync>,
    options: RetryOptions,
    resolver: Resolver<T>,
    attempt_number: u32,
) {
    let promise = factory();
    promise.subscribe(move |result| match result {
        Ok(value) => resolver.resolve(value),
        Err(e) => {
            if attempt_number < options.max_attempts && options.should_retry(&e, attempt_number) {
                let backoff = options.backoff(attempt_number);
                let next = handle.clone();
                handle.schedule_after(backoff, move || {
                    attempt(next, factory, options, resolver, attempt_number + 1);
                });
            } else {
                resolver.reject(e);
            }
        },
    });
}
