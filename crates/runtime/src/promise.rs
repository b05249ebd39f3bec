//! The promise state machine.
//!
//! A promise settles exactly once. Continuations registered before the
//! settle run in registration order immediately after it; continuations
//! registered afterwards run at registration. Rejections are shared, so the
//! error type is cheaply cloneable.
//!
//! Promises implement [`Future`], which is how a coroutine awaits one: the
//! settled value comes back as `Ok` and a rejection surfaces as `Err` for
//! the caller to propagate with `?`.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
        Waker,
    },
};

use common::{
    Error,
    Result,
};
use parking_lot::Mutex;

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send>;

struct Inner<T> {
    state: Option<Result<T>>,
    continuations: Vec<Continuation<T>>,
    wakers: Vec<Waker>,
    cancel_requested: bool,
    cancel_handlers: Vec<Box<dyn FnOnce() + Send>>,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            state: None,
            continuations: Vec::new(),
            wakers: Vec::new(),
            cancel_requested: false,
            cancel_handlers: Vec::new(),
        }
    }
}

pub struct Promise<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The producer half of a promise. Cloneable; `resolve` and `reject` are
/// idempotent after the first settle.
pub struct Resolver<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Clone + 'static> Promise<T> {
    pub fn pending() -> (Promise<T>, Resolver<T>) {
        let inner = Arc::new(Mutex::new(Inner::new()));
        (
            Promise {
                inner: inner.clone(),
            },
            Resolver { inner },
        )
    }

    pub fn resolved(value: T) -> Promise<T> {
        let (p, resolver) = Promise::pending();
        resolver.resolve(value);
        p
    }

    pub fn rejected(error: Error) -> Promise<T> {
        let (p, resolver) = Promise::pending();
        resolver.reject(error);
        p
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().state.is_some()
    }

    /// The settled result, if any. Used by the loop to recover a result
    /// after the driver went idle and by tests.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.inner.lock().state.clone()
    }

    /// Register a continuation. Runs immediately if the promise has already
    /// settled, otherwise in registration order after the settle.
    pub fn subscribe(&self, f: impl FnOnce(Result<T>) + Send + 'static) {
        let state = {
            let mut inner = self.inner.lock();
            if inner.state.is_none() {
                inner.continuations.push(Box::new(f));
                return;
            }
            inner.state.clone().expect("checked above")
        };
        f(state);
    }

    /// Chain a continuation that itself returns a promise; the returned
    /// promise adopts the inner one's eventual state.
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Send + Clone + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let (p, resolver) = Promise::pending();
        self.subscribe(move |result| match result {
            Ok(value) => {
                let inner = f(value);
                inner.subscribe(move |r| resolver.settle(r));
            },
            Err(e) => resolver.reject(e),
        });
        self.propagate_cancel_to(&p);
        p
    }

    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Send + Clone + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (p, resolver) = Promise::pending();
        self.subscribe(move |result| resolver.settle(result.map(f)));
        self.propagate_cancel_to(&p);
        p
    }

    /// Handle a rejection by producing a replacement promise; fulfillments
    /// pass through untouched.
    pub fn catch<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Error) -> Promise<T> + Send + 'static,
    {
        let (p, resolver) = Promise::pending();
        self.subscribe(move |result| match result {
            Ok(value) => resolver.resolve(value),
            Err(e) => {
                let inner = f(e);
                inner.subscribe(move |r| resolver.settle(r));
            },
        });
        self.propagate_cancel_to(&p);
        p
    }

    pub fn map_err<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Error) -> Error + Send + 'static,
    {
        let (p, resolver) = Promise::pending();
        self.subscribe(move |result| resolver.settle(result.map_err(f)));
        self.propagate_cancel_to(&p);
        p
    }

    /// Run `f` when the promise settles either way; the result passes
    /// through unchanged.
    pub fn finally<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let (p, resolver) = Promise::pending();
        self.subscribe(move |result| {
            f();
            resolver.settle(result);
        });
        self.propagate_cancel_to(&p);
        p
    }

    /// Register a cancel handler invoked by [`Promise::cancel`], in
    /// registration order. If the promise was already cancelled the handler
    /// runs immediately. Handlers must be idempotent.
    pub fn on_cancel(&self, handler: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.inner.lock();
            if !inner.cancel_requested {
                inner.cancel_handlers.push(Box::new(handler));
                return;
            }
        }
        handler();
    }

    /// Cancel the promise: runs the registered cancel handlers and rejects
    /// with Cancelled if still pending. Idempotent; later settles are
    /// dropped by settle-once semantics.
    pub fn cancel(&self) {
        let handlers = {
            let mut inner = self.inner.lock();
            if inner.cancel_requested {
                return;
            }
            inner.cancel_requested = true;
            std::mem::take(&mut inner.cancel_handlers)
        };
        for handler in handlers {
            handler();
        }
        Resolver {
            inner: self.inner.clone(),
        }
        .reject(Error::cancelled("promise cancelled"));
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancel_requested
    }

    /// Cancelling a derived promise cancels this one, so a timeout applied
    /// at the end of a `map`/`then` chain reaches the operation that owns
    /// the cancel handler.
    fn propagate_cancel_to<U: Send + Clone + 'static>(&self, derived: &Promise<U>) {
        let source = self.clone();
        derived.on_cancel(move || source.cancel());
    }
}

impl<T: Send + Clone + 'static> Resolver<T> {
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, error: Error) {
        self.settle(Err(error));
    }

    pub fn settle(&self, result: Result<T>) {
        let (continuations, wakers) = {
            let mut inner = self.inner.lock();
            if inner.state.is_some() {
                return;
            }
            inner.state = Some(result.clone());
            // The settle consumed any pending cancellation window.
            inner.cancel_handlers.clear();
            (
                std::mem::take(&mut inner.continuations),
                std::mem::take(&mut inner.wakers),
            )
        };
        for continuation in continuations {
            continuation(result.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T: Send + Clone + 'static> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock();
        if let Some(state) = &inner.state {
            return Poll::Ready(state.clone());
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    use common::ErrorKind;

    use super::*;

    #[test]
    fn test_settle_is_terminal() {
        let (p, resolver) = Promise::<u32>::pending();
        resolver.resolve(1);
        resolver.resolve(2);
        resolver.reject(Error::transport("late"));
        assert_eq!(p.try_result().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_continuations_run_in_registration_order() {
        let (p, resolver) = Promise::<u32>::pending();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            p.subscribe(move |_| order.lock().push(i));
        }
        resolver.resolve(7);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_continuation_runs_exactly_once_after_settle() {
        let (p, resolver) = Promise::<u32>::pending();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        p.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        resolver.resolve(1);
        resolver.resolve(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Late registration still fires, once.
        let c = count.clone();
        p.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_then_adopts_inner_promise() {
        let (outer, resolver) = Promise::<u32>::pending();
        let (inner, inner_resolver) = Promise::<String>::pending();
        let chained = outer.then(move |v| {
            assert_eq!(v, 3);
            inner
        });
        resolver.resolve(3);
        assert!(!chained.is_settled());
        inner_resolver.resolve("adopted".to_owned());
        assert_eq!(chained.try_result().unwrap().unwrap(), "adopted");
    }

    #[test]
    fn test_rejection_skips_then_and_hits_catch() {
        let (p, resolver) = Promise::<u32>::pending();
        let chained = p
            .then(|v| Promise::resolved(v + 1))
            .catch(|e| {
                assert_eq!(*e.kind(), ErrorKind::Transport);
                Promise::resolved(99)
            });
        resolver.reject(Error::transport("boom"));
        assert_eq!(chained.try_result().unwrap().unwrap(), 99);
    }

    #[test]
    fn test_finally_runs_on_both_arms() {
        let count = Arc::new(AtomicUsize::new(0));

        let (p, resolver) = Promise::<u32>::pending();
        let c = count.clone();
        let out = p.finally(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        resolver.resolve(5);
        assert_eq!(out.try_result().unwrap().unwrap(), 5);

        let (p, resolver) = Promise::<u32>::pending();
        let c = count.clone();
        let out = p.finally(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        resolver.reject(Error::timeout("slow"));
        assert!(out.try_result().unwrap().is_err());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_rejects_pending_and_runs_handler_once() {
        let (p, _resolver) = Promise::<u32>::pending();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        p.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        p.cancel();
        p.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let err = p.try_result().unwrap().unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_cancel_tombstones_later_settle() {
        let (p, resolver) = Promise::<u32>::pending();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        p.subscribe(move |r| s.lock().push(r.is_ok()));
        p.cancel();
        resolver.resolve(42);
        // The continuation fired once, for the cancellation, and the late
        // resolution was dropped.
        assert_eq!(*seen.lock(), vec![false]);
    }

    #[test]
    fn test_cancel_after_settle_is_a_no_op() {
        let (p, resolver) = Promise::<u32>::pending();
        resolver.resolve(1);
        p.cancel();
        assert_eq!(p.try_result().unwrap().unwrap(), 1);
    }
}
