//! The cooperative runtime: a single-threaded event loop, promises,
//! coroutines, combinators, readiness watching, and non-blocking file I/O.
//!
//! ```text
//! let event_loop = EventLoop::new()?;
//! let handle = event_loop.handle();
//! let value = event_loop.block_on(async move {
//!     delay(&handle, Duration::from_millis(10)).await?;
//!     Ok(42)
//! })?;
//! ```

pub mod combinators;
pub mod event_loop;
pub mod fs;
pub mod io;
mod metrics;
pub mod promise;
pub mod timer;

pub use event_loop::{
    spawn_local,
    EventLoop,
    LoopHandle,
    WorkGuard,
    WorkKind,
};
pub use promise::{
    Promise,
    Resolver,
};
pub use timer::TimerId;
