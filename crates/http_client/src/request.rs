//! The typed request that flows through the pipeline.

use std::time::Duration;

use bytes::Bytes;
use http::{
    HeaderMap,
    Method,
};
use url::Url;

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    /// Ask the transport to negotiate HTTP/2 where it can; the response
    /// surface is the same either way.
    pub prefer_http2: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            prefer_http2: false,
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}
