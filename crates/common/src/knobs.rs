//! Tunable limits and parameters.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each should have a comment explaining what it's for so it can be
//! adjusted safely.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Upper bound on how long a single loop tick may block waiting for
/// readiness when no timer is due sooner. Milliseconds.
pub static LOOP_POLL_CAP_MS: LazyLock<u64> = LazyLock::new(|| env_config("LOOP_POLL_CAP_MS", 250));

/// Forces the readiness wait down to 1ms regardless of the next timer,
/// trading CPU for latency. Mirrors the high resolution poll switch of the
/// selector backends.
pub static FORCE_HIGH_RES_POLL: LazyLock<bool> =
    LazyLock::new(|| env_config("FORCE_HIGH_RES_POLL", false));

/// Default per-request HTTP budget. Seconds; 0 disables the budget.
pub static HTTP_DEFAULT_TIMEOUT_SECS: LazyLock<u64> =
    LazyLock::new(|| env_config("HTTP_DEFAULT_TIMEOUT_SECS", 30));

/// Maximum entries held by the in-memory HTTP response cache.
pub static HTTP_CACHE_MAX_ENTRIES: LazyLock<usize> =
    LazyLock::new(|| env_config("HTTP_CACHE_MAX_ENTRIES", 1024));

/// How long a MySQL command may run before the connection is considered
/// wedged and the command fails with a timeout. Seconds.
pub static MYSQL_TIMEOUT_SECS: LazyLock<u64> =
    LazyLock::new(|| env_config("MYSQL_TIMEOUT_SECS", 120));

/// Default maximum size of a MySQL connection pool.
pub static MYSQL_MAX_CONNECTIONS: LazyLock<usize> =
    LazyLock::new(|| env_config("MYSQL_MAX_CONNECTIONS", 8));

/// Interval between mtime polls for file watches. Milliseconds.
pub static FILE_WATCH_POLL_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("FILE_WATCH_POLL_MS", 200));

/// Chunk size for streamed file reads and writes when the caller doesn't
/// specify one.
pub static FILE_STREAM_BUFFER_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("FILE_STREAM_BUFFER_SIZE", 64 * 1024));

/// Effective poll cap after applying the high resolution override.
pub fn loop_poll_cap() -> Duration {
    if *FORCE_HIGH_RES_POLL {
        Duration::from_millis(1)
    } else {
        Duration::from_millis(*LOOP_POLL_CAP_MS)
    }
}
