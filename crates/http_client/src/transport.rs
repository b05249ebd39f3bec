//! The transport seam. Production requests go through [`ReqwestTransport`];
//! tests swap in the mock from [`crate::testing`].

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    Error,
    ErrorKind,
    Result,
};
use futures::{
    stream::BoxStream,
    StreamExt,
};
use http::{
    HeaderMap,
    StatusCode,
    Version,
};
use url::Url;

use crate::request::HttpRequest;

pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub version: Version,
    pub final_url: Url,
    pub body: BoxStream<'static, Result<Bytes>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one attempt of the request. `attempt` is 1-based; the mock
    /// transport uses it to drive failure sequences.
    async fn execute(&self, request: &HttpRequest, attempt: u32) -> Result<TransportResponse>;
}

/// The production transport. The underlying client maintains a connection
/// pool, so one instance serves every transfer of the loop.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::with_cause(ErrorKind::Transport, "failed to build client", e.into()))?;
        Ok(Self { client })
    }
}

fn classify(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::with_cause(ErrorKind::Timeout, "request timed out", e.into())
    } else {
        Error::with_cause(ErrorKind::Transport, "transport failure", e.into())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest, _attempt: u32) -> Result<TransportResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if request.prefer_http2 && request.url.scheme() == "https" {
            builder = builder.version(Version::HTTP_2);
        }
        let raw = builder.build().map_err(classify)?;
        let response = self.client.execute(raw).await.map_err(classify)?;

        let status = response.status();
        let headers = response.headers().clone();
        let version = response.version();
        let final_url = response.url().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify))
            .boxed();
        Ok(TransportResponse {
            status,
            headers,
            version,
            final_url,
            body,
        })
    }
}
