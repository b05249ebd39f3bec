use std::sync::LazyLock;

use common::metrics::register_counter;
use prometheus::IntCounter;

static LOOP_TICKS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("loop_ticks_total", "Driver ticks executed"));

static LOOP_MICROTASKS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("loop_microtasks_total", "Microtasks drained"));

static LOOP_TIMERS_FIRED_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("loop_timers_fired_total", "Timer callbacks fired"));

static LOOP_COROUTINES_SPAWNED_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("loop_coroutines_spawned_total", "Coroutines spawned"));

pub fn log_tick() {
    LOOP_TICKS_TOTAL.inc();
}

pub fn log_microtask() {
    LOOP_MICROTASKS_TOTAL.inc();
}

pub fn log_timer_fired() {
    LOOP_TIMERS_FIRED_TOTAL.inc();
}

pub fn log_coroutine_spawned() {
    LOOP_COROUTINES_SPAWNED_TOTAL.inc();
}
