//! Promise-based HTTP client for the event loop: request builder,
//! interceptor pipeline, fingerprinted response cache, cookie jar, retry
//! policy, streaming and download, plus a mock transport for tests.

pub mod cache;
mod client;
pub mod cookies;
mod metrics;
pub mod request;
pub mod response;
pub mod retry;
pub mod testing;
pub mod transport;

pub use client::{
    Download,
    HttpClient,
    HttpClientBuilder,
    RequestBuilder,
    RequestHistory,
    RequestRecord,
};
pub use request::HttpRequest;
pub use response::HttpResponse;
pub use retry::RetryPolicy;
