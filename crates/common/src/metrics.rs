//! Process-wide metrics registry. Crates register their counters and
//! histograms here from `LazyLock` statics in their own `metrics.rs`.

use std::sync::LazyLock;

use prometheus::{
    Histogram,
    HistogramOpts,
    IntCounter,
    IntCounterVec,
    IntGauge,
    Opts,
    Registry,
};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("Invalid counter spec");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("Duplicate metric registration");
    counter
}

pub fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("Invalid counter spec");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("Duplicate metric registration");
    counter
}

pub fn register_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("Invalid gauge spec");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("Duplicate metric registration");
    gauge
}

pub fn register_histogram(name: &str, help: &str) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help))
        .expect("Invalid histogram spec");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("Duplicate metric registration");
    histogram
}
