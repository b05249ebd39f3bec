//! The response view handed back to callers. Immutable; `with_*` return
//! updated copies.

use bytes::Bytes;
use common::{
    Error,
    ErrorKind,
    Result,
};
use http::{
    HeaderMap,
    HeaderName,
    HeaderValue,
    StatusCode,
    Version,
};
use serde::de::DeserializeOwned;
use url::Url;

#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    version: Version,
    final_url: Url,
}

impl HttpResponse {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        version: Version,
        final_url: Url,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            version,
            final_url,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| Error::with_cause(ErrorKind::Protocol, "body is not UTF-8", e.into()))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::with_cause(ErrorKind::Protocol, "body is not valid JSON", e.into()))
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The URI the response ultimately came from, after redirects.
    pub fn final_url(&self) -> &Url {
        &self.final_url
    }

    pub fn with_header(&self, name: &str, value: &str) -> Result<Self> {
        let mut updated = self.clone();
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::usage(format!("invalid header name: {name}")))?;
        let value: HeaderValue = value
            .parse()
            .map_err(|_| Error::usage(format!("invalid header value for {name}")))?;
        updated.headers.insert(name, value);
        Ok(updated)
    }

    pub fn with_body(&self, body: Bytes) -> Self {
        let mut updated = self.clone();
        updated.body = body;
        updated
    }
}
