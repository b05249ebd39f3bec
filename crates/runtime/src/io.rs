//! Readiness watching over raw file descriptors.
//!
//! A watch registers the fd with the executor's I/O driver and invokes the
//! callback each time the fd becomes ready. Cached readiness is cleared
//! before each invocation, so the callback is expected to consume what is
//! available (read until `WouldBlock`, or write what it can).

use std::{
    os::unix::io::{
        AsRawFd,
        RawFd,
    },
    sync::Arc,
};

use tokio::{
    io::{
        unix::AsyncFd,
        Interest,
    },
    sync::Notify,
};

use crate::event_loop::{
    LoopHandle,
    WorkKind,
};

// Borrows the fd for the lifetime of the watch; the caller keeps ownership
// and is responsible for closing it after unwatching.
struct Watched(RawFd);

impl AsRawFd for Watched {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

pub struct WatchToken {
    stop: Arc<Notify>,
}

impl WatchToken {
    /// Stop watching. The fd is deregistered and the watcher's work unit is
    /// released exactly once.
    pub fn unwatch(self) {
        self.stop.notify_one();
    }
}

pub fn watch_readable(
    handle: &LoopHandle,
    fd: RawFd,
    callback: impl FnMut() + Send + 'static,
) -> WatchToken {
    watch(handle, fd, Interest::READABLE, callback)
}

pub fn watch_writable(
    handle: &LoopHandle,
    fd: RawFd,
    callback: impl FnMut() + Send + 'static,
) -> WatchToken {
    watch(handle, fd, Interest::WRITABLE, callback)
}

fn watch(
    handle: &LoopHandle,
    fd: RawFd,
    interest: Interest,
    mut callback: impl FnMut() + Send + 'static,
) -> WatchToken {
    let stop = Arc::new(Notify::new());
    let stop_rx = stop.clone();
    let guard = handle.register_work(WorkKind::Watcher);
    handle.spawn_detached("fd_watch", async move {
        let _guard = guard;
        let afd = match AsyncFd::with_interest(Watched(fd), interest) {
            Ok(afd) => afd,
            Err(e) => {
                tracing::error!("failed to register fd {fd} with the I/O driver: {e}");
                return;
            },
        };
        loop {
            tokio::select! {
                _ = stop_rx.notified() => break,
                ready = afd.ready(interest) => match ready {
                    Ok(mut ready_guard) => {
                        ready_guard.clear_ready();
                        callback();
                    },
                    Err(e) => {
                        tracing::error!("readiness wait on fd {fd} failed: {e}");
                        break;
                    },
                },
            }
        }
    });
    WatchToken { stop }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        os::unix::{
            io::AsRawFd,
            net::UnixStream,
        },
        sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Arc,
        },
        time::Duration,
    };

    use crate::{
        combinators::delay,
        event_loop::EventLoop,
        io::watch_readable,
    };

    #[test]
    fn test_watch_readable_fires_on_data() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fires = Arc::new(AtomicUsize::new(0));

        let fires2 = fires.clone();
        let result = event_loop.block_on(async move {
            let reader = reader; // keep alive for the watch duration
            let fd = reader.as_raw_fd();
            let drained = reader.try_clone().unwrap();
            let token = watch_readable(&handle, fd, move || {
                use std::io::Read;
                let mut buf = [0u8; 64];
                let mut stream = &drained;
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    fires2.fetch_add(1, Ordering::SeqCst);
                }
            });
            writer.write_all(b"ping").unwrap();
            delay(&handle, Duration::from_millis(100)).await?;
            token.unwatch();
            Ok(())
        });
        result.unwrap();
        assert!(fires.load(Ordering::SeqCst) >= 1);
    }
}
