use std::{
    sync::LazyLock,
    time::Duration,
};

use common::metrics::{
    register_counter,
    register_histogram,
};
use prometheus::{
    Histogram,
    IntCounter,
};

static HTTP_REQUESTS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("http_requests_total", "Requests entering the pipeline"));

static HTTP_CACHE_HITS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("http_cache_hits_total", "Responses served from cache"));

static HTTP_CACHE_STORES_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("http_cache_stores_total", "Responses written to cache"));

static HTTP_RETRIES_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("http_retries_total", "Attempts beyond the first"));

static HTTP_ATTEMPT_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram("http_attempt_seconds", "Latency of one transport attempt")
});

pub fn log_request() {
    HTTP_REQUESTS_TOTAL.inc();
}

pub fn log_cache_hit() {
    HTTP_CACHE_HITS_TOTAL.inc();
}

pub fn log_cache_store() {
    HTTP_CACHE_STORES_TOTAL.inc();
}

pub fn log_retry() {
    HTTP_RETRIES_TOTAL.inc();
}

pub fn log_attempt_latency(elapsed: Duration) {
    HTTP_ATTEMPT_SECONDS.observe(elapsed.as_secs_f64());
}
