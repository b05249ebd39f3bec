//! The single-threaded reactor.
//!
//! One `EventLoop` per subsystem; everything asynchronous in this workspace
//! is driven by it. The loop composes the timer heap, the microtask queue,
//! readiness watchers, file-op offloads, and network transfers, and resumes
//! coroutines (local tasks) as the promises they await settle.
//!
//! Each driver tick:
//! 1. drains the microtask queue, bounded to the entries present at tick
//!    start so a microtask storm cannot starve I/O;
//! 2. fires due timers in (due time, insertion) order;
//! 3. waits at most `min(next timer delta, poll cap)` for a wake-up, during
//!    which the executor delivers readiness and resumes runnable
//!    coroutines.
//!
//! The loop exits when `stop()` is called or when no work remains: no live
//! timers, watchers, transfers, file ops or coroutines, and an empty
//! microtask queue.

use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

use common::{
    knobs,
    Error,
    Result,
};
use futures::{
    future::BoxFuture,
    FutureExt,
};
use parking_lot::Mutex;
use tokio::{
    sync::{
        mpsc,
        Notify,
    },
    task::LocalSet,
};

use crate::{
    metrics,
    promise::{
        Promise,
        Resolver,
    },
    timer::{
        TimerCallback,
        TimerHeap,
        TimerId,
    },
};

/// The kinds of work the loop accounts for when deciding whether it may
/// terminate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkKind {
    Coroutine,
    Watcher,
    Transfer,
    FileOp,
}

impl WorkKind {
    fn index(self) -> usize {
        match self {
            WorkKind::Coroutine => 0,
            WorkKind::Watcher => 1,
            WorkKind::Transfer => 2,
            WorkKind::FileOp => 3,
        }
    }
}

/// Keeps the loop alive while held. Dropping it releases the work unit and
/// wakes the driver so it can re-evaluate quiescence; this is the release
/// hook for cancelled transfers and file ops, and it fires exactly once.
pub struct WorkGuard {
    shared: Arc<Shared>,
    kind: WorkKind,
}

impl WorkGuard {
    fn new(shared: Arc<Shared>, kind: WorkKind) -> Self {
        shared.work[kind.index()].fetch_add(1, Ordering::SeqCst);
        Self { shared, kind }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.shared.work[self.kind.index()].fetch_sub(1, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

type ErrorSink = Arc<dyn Fn(String) + Send + Sync>;

pub(crate) struct Shared {
    timers: Mutex<TimerHeap>,
    microtasks: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    spawn_tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    wake: Notify,
    stopped: AtomicBool,
    work: [AtomicUsize; 4],
    next_timer_id: AtomicU64,
    error_sink: Mutex<Option<ErrorSink>>,
}

impl Shared {
    fn is_idle(&self) -> bool {
        self.work.iter().all(|c| c.load(Ordering::SeqCst) == 0)
            && self.timers.lock().live_count() == 0
            && self.microtasks.lock().is_empty()
    }

    fn report_error(&self, message: String) {
        let sink = self.error_sink.lock().clone();
        match sink {
            Some(sink) => sink(message),
            None => tracing::error!("{message}"),
        }
    }
}

/// Cheap handle onto a running (or about to run) loop. Clone freely.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Schedule `callback` to run once after `delay`.
    pub fn schedule_after(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerId {
        let id = self.next_timer_id();
        self.shared.timers.lock().insert(
            id,
            Instant::now() + delay,
            TimerCallback::Once(Box::new(callback)),
        );
        self.shared.wake.notify_one();
        id
    }

    /// Schedule `callback` to run every `interval`, starting one interval
    /// from now.
    pub fn schedule_repeating(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let id = self.next_timer_id();
        self.shared.timers.lock().insert(
            id,
            Instant::now() + interval,
            TimerCallback::Repeating {
                interval,
                callback: Box::new(callback),
            },
        );
        self.shared.wake.notify_one();
        id
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let cancelled = self.shared.timers.lock().cancel(id);
        if cancelled {
            self.shared.wake.notify_one();
        }
        cancelled
    }

    /// Enqueue a microtask: runs before the loop waits again, ahead of I/O.
    pub fn schedule_immediate(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.microtasks.lock().push_back(Box::new(callback));
        self.shared.wake.notify_one();
    }

    /// Spawn a coroutine onto the loop. The returned promise settles with
    /// the coroutine's result; a panic inside it is caught at the loop
    /// boundary and surfaced as a rejection.
    pub fn spawn<T, F>(&self, name: &'static str, fut: F) -> Promise<T>
    where
        T: Send + Clone + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (promise, resolver) = Promise::pending();
        // The work unit is taken here, not at first poll, so the loop can
        // never observe quiescence between the spawn and the task starting.
        let guard = WorkGuard::new(self.shared.clone(), WorkKind::Coroutine);
        let body = run_coroutine(self.shared.clone(), name, fut, resolver.clone(), guard);
        if self.shared.spawn_tx.send(body.boxed()).is_err() {
            resolver.reject(Error::usage("event loop is gone"));
        }
        promise
    }

    /// Spawn a coroutine whose result nobody awaits.
    pub fn spawn_detached<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _: Promise<()> = self.spawn(name, async move {
            fut.await;
            Ok(())
        });
    }

    /// Account a unit of loop work (an HTTP transfer, a file op). The loop
    /// will not terminate while the guard is alive.
    pub fn register_work(&self, kind: WorkKind) -> WorkGuard {
        WorkGuard::new(self.shared.clone(), kind)
    }

    /// Ask the loop to exit after the current tick.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Replace the sink that receives errors escaping loop callbacks.
    pub fn set_error_sink(&self, sink: impl Fn(String) + Send + Sync + 'static) {
        *self.shared.error_sink.lock() = Some(Arc::new(sink));
    }

    fn next_timer_id(&self) -> TimerId {
        TimerId(self.shared.next_timer_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Spawn a coroutine from inside the loop, without a `Send` bound on the
/// future. Panics if called from outside a running loop.
pub fn spawn_local<T, F>(handle: &LoopHandle, name: &'static str, fut: F) -> Promise<T>
where
    T: Send + Clone + 'static,
    F: Future<Output = Result<T>> + 'static,
{
    let (promise, resolver) = Promise::pending();
    let guard = WorkGuard::new(handle.shared.clone(), WorkKind::Coroutine);
    tokio::task::spawn_local(run_coroutine(handle.shared.clone(), name, fut, resolver, guard));
    promise
}

async fn run_coroutine<T, F>(
    shared: Arc<Shared>,
    name: &'static str,
    fut: F,
    resolver: Resolver<T>,
    guard: WorkGuard,
) where
    T: Send + Clone + 'static,
    F: Future<Output = Result<T>>,
{
    metrics::log_coroutine_spawned();
    let _guard = guard;
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => resolver.settle(result),
        Err(_panic) => {
            shared.report_error(format!("coroutine '{name}' panicked"));
            resolver.reject(Error::usage(format!("coroutine '{name}' panicked")));
        },
    }
}

pub struct EventLoop {
    rt: tokio::runtime::Runtime,
    local: LocalSet,
    handle: LoopHandle,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::with_cause(common::ErrorKind::Usage, "failed to build executor", e.into()))?;
        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            timers: Mutex::new(TimerHeap::new()),
            microtasks: Mutex::new(VecDeque::new()),
            spawn_tx,
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            work: Default::default(),
            next_timer_id: AtomicU64::new(1),
            error_sink: Mutex::new(None),
        });
        let local = LocalSet::new();
        // The pump forwards handle-spawned coroutines onto the local set.
        // It is deliberately not accounted as work.
        local.spawn_local(async move {
            let mut spawn_rx = spawn_rx;
            while let Some(body) = spawn_rx.recv().await {
                tokio::task::spawn_local(body);
            }
        });
        Ok(Self {
            rt,
            local,
            handle: LoopHandle { shared },
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Spawn a coroutine before or between runs; the future need not be
    /// `Send`.
    pub fn spawn<T, F>(&self, name: &'static str, fut: F) -> Promise<T>
    where
        T: Send + Clone + 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let (promise, resolver) = Promise::pending();
        let guard = WorkGuard::new(self.handle.shared.clone(), WorkKind::Coroutine);
        self.local.spawn_local(run_coroutine(
            self.handle.shared.clone(),
            name,
            fut,
            resolver,
            guard,
        ));
        promise
    }

    /// Drive the loop until `stop()` or quiescence.
    pub fn run(&self) {
        let shared = self.handle.shared.clone();
        self.rt.block_on(self.local.run_until(drive(shared)));
    }

    /// Spawn `fut` as a coroutine and drive the loop until it settles.
    pub fn block_on<T, F>(&self, fut: F) -> Result<T>
    where
        T: Send + Clone + 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let promise = self.spawn("block_on", fut);
        let shared = self.handle.shared.clone();
        let awaited = promise.clone();
        self.rt.block_on(self.local.run_until(async move {
            let driver = drive(shared);
            tokio::pin!(driver);
            tokio::select! {
                result = awaited => result,
                _ = &mut driver => promise.try_result().unwrap_or_else(|| {
                    Err(Error::usage(
                        "event loop became idle before the awaited coroutine settled",
                    ))
                }),
            }
        }))
    }
}

async fn drive(shared: Arc<Shared>) {
    loop {
        metrics::log_tick();

        // Phase 1: microtasks, bounded to the tick-start backlog.
        let batch = shared.microtasks.lock().len();
        for _ in 0..batch {
            let Some(callback) = shared.microtasks.lock().pop_front() else {
                break;
            };
            metrics::log_microtask();
            run_callback(&shared, callback);
        }

        // Phase 2: due timers, in (due, insertion) order.
        let now = Instant::now();
        let due = shared.timers.lock().pop_due(now);
        for entry in due {
            metrics::log_timer_fired();
            match entry.callback {
                TimerCallback::Once(callback) => {
                    run_callback(&shared, callback);
                    shared.timers.lock().finish(entry.id);
                },
                TimerCallback::Repeating {
                    interval,
                    mut callback,
                } => {
                    let panicked =
                        std::panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err();
                    if panicked {
                        shared.report_error("repeating timer callback panicked".to_owned());
                        shared.timers.lock().finish(entry.id);
                    } else {
                        let next = (entry.due + interval).max(now);
                        shared.timers.lock().rearm(
                            entry.id,
                            next,
                            TimerCallback::Repeating { interval, callback },
                        );
                    }
                },
            }
        }

        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        if shared.is_idle() {
            break;
        }

        // Phase 3: bounded wait. Readiness, transfer completions, and
        // coroutine wake-ups are delivered by the executor while we're
        // parked; anything that changes loop state rings `wake`.
        let cap = knobs::loop_poll_cap();
        let wait = match shared.timers.lock().next_due() {
            Some(next_due) => next_due.saturating_duration_since(Instant::now()).min(cap),
            None => cap,
        };
        tokio::select! { biased;
            _ = shared.wake.notified() => {},
            _ = tokio::time::sleep(wait) => {},
        }
        // Give every task made runnable during the wait a chance to run
        // before the next tick's bookkeeping.
        tokio::task::yield_now().await;
    }
}

fn run_callback(shared: &Arc<Shared>, callback: Box<dyn FnOnce() + Send>) {
    if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        shared.report_error("loop callback panicked".to_owned());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{
                AtomicUsize,
                Ordering as AtomicOrdering,
            },
            Arc,
        },
        time::Duration,
    };

    use common::ErrorKind;
    use parking_lot::Mutex;

    use super::*;
    use crate::combinators::delay;

    #[test]
    fn test_block_on_returns_coroutine_result() {
        let event_loop = EventLoop::new().unwrap();
        let value = event_loop.block_on(async { Ok(41 + 1) }).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_run_exits_immediately_when_no_work() {
        let event_loop = EventLoop::new().unwrap();
        let start = std::time::Instant::now();
        event_loop.run();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay_ms, tag) in [(60u64, 3u32), (20, 1), (40, 2)] {
            let order = order.clone();
            handle.schedule_after(Duration::from_millis(delay_ms), move || {
                order.lock().push(tag);
            });
        }
        let h = handle.clone();
        event_loop
            .block_on(async move { delay(&h, Duration::from_millis(150)).await })
            .unwrap();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_immediate_runs_before_zero_delay_timer() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            handle.schedule_after(Duration::ZERO, move || order.lock().push("timer"));
        }
        {
            let order = order.clone();
            handle.schedule_immediate(move || order.lock().push("microtask"));
        }
        let h = handle.clone();
        event_loop
            .block_on(async move { delay(&h, Duration::from_millis(50)).await })
            .unwrap();
        assert_eq!(*order.lock(), vec!["microtask", "timer"]);
    }

    #[test]
    fn test_microtask_storm_does_not_wedge_the_tick() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let count = Arc::new(AtomicUsize::new(0));

        fn reschedule(handle: LoopHandle, count: Arc<AtomicUsize>) {
            if count.fetch_add(1, AtomicOrdering::SeqCst) < 1000 {
                let h = handle.clone();
                handle.schedule_immediate(move || reschedule(h.clone(), count));
            }
        }
        reschedule(handle.clone(), count.clone());

        let h = handle.clone();
        event_loop
            .block_on(async move { delay(&h, Duration::from_millis(100)).await })
            .unwrap();
        assert!(count.load(AtomicOrdering::SeqCst) >= 1000);
    }

    #[test]
    fn test_repeating_timer_fires_until_cancelled() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = handle.schedule_repeating(Duration::from_millis(10), move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
        });
        let h = handle.clone();
        event_loop
            .block_on(async move {
                delay(&h, Duration::from_millis(105)).await?;
                h.cancel_timer(timer);
                Ok(())
            })
            .unwrap();
        let fired = count.load(AtomicOrdering::SeqCst);
        assert!((5..=12).contains(&fired), "fired {fired} times");
    }

    #[test]
    fn test_stop_ends_run() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let h = handle.clone();
        handle.schedule_after(Duration::from_millis(20), move || h.stop());
        // Keep the loop alive well past the stop request; stop must win.
        handle.schedule_after(Duration::from_secs(60), || ());
        let start = std::time::Instant::now();
        event_loop.run();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_panicking_coroutine_rejects_and_loop_survives() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let h = handle.clone();
        let result = event_loop.block_on(async move {
            let doomed: Promise<u32> = h.spawn("doomed", async { panic!("kaboom") });
            let err = doomed.await.unwrap_err();
            assert_eq!(*err.kind(), ErrorKind::Usage);
            // The loop is still healthy enough to run a timer.
            delay(&h, Duration::from_millis(10)).await?;
            Ok(7)
        });
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_panicking_timer_callback_reaches_error_sink() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            handle.set_error_sink(move |message| seen.lock().push(message));
        }
        handle.schedule_after(Duration::ZERO, || panic!("timer bomb"));
        let h = handle.clone();
        event_loop
            .block_on(async move { delay(&h, Duration::from_millis(50)).await })
            .unwrap();
        assert!(!seen.lock().is_empty());
    }

    #[test]
    fn test_spawned_coroutines_resume_in_settle_order() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        let h = handle.clone();
        let o = order.clone();
        event_loop
            .block_on(async move {
                let mut waits = Vec::new();
                for (tag, ms) in [(2u32, 40u64), (1, 20), (3, 60)] {
                    let h2 = h.clone();
                    let o2 = o.clone();
                    waits.push(h.spawn("sleeper", async move {
                        delay(&h2, Duration::from_millis(ms)).await?;
                        o2.lock().push(tag);
                        Ok(())
                    }));
                }
                for wait in waits {
                    wait.await?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }
}
