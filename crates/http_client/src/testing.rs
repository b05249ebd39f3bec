//! The in-process mock transport: matchers over (method, URL pattern,
//! header predicates) mapped to canned responses, with delays, limited or
//! infinite persistence, failure sequences, per-response cookies, request
//! history, and assertions. A drop-in [`Transport`] for tests.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    Error,
    ErrorKind,
    Result,
};
use futures::StreamExt;
use http::{
    HeaderMap,
    HeaderName,
    HeaderValue,
    Method,
    StatusCode,
    Version,
};
use parking_lot::Mutex;
use runtime::LoopHandle;
use serde::Serialize;

use crate::{
    cache::CacheConfig,
    client::{
        glob_match,
        HttpClient,
        RequestBuilder,
    },
    request::HttpRequest,
    transport::{
        Transport,
        TransportResponse,
    },
};

#[derive(Clone, Debug)]
pub enum MockFailure {
    /// A connection-level failure before any response.
    Transport,
    Timeout,
    /// A real response with this status and an empty body.
    Status(u16),
}

#[derive(Clone, Debug)]
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: Vec<Bytes>,
    set_cookies: Vec<String>,
    delay: Option<Duration>,
}

impl MockResponse {
    fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            chunks: vec![Bytes::new()],
            set_cookies: Vec::new(),
            delay: None,
        }
    }
}

/// One registered matcher plus its canned response.
pub struct Mock {
    method: Option<Method>,
    url_pattern: String,
    header_predicates: Vec<(String, String)>,
    response: MockResponse,
    /// `None` persists forever; `Some(n)` serves n responses then stops
    /// matching.
    remaining: Option<u32>,
    fail_until_attempt: Option<u32>,
    fail_sequence: VecDeque<MockFailure>,
    attempts: u32,
}

impl Mock {
    pub fn new(method: Option<Method>, url_pattern: impl Into<String>) -> Self {
        Self {
            method,
            url_pattern: url_pattern.into(),
            header_predicates: Vec::new(),
            response: MockResponse::new(200),
            remaining: None,
            fail_until_attempt: None,
            fail_sequence: VecDeque::new(),
            attempts: 0,
        }
    }

    pub fn get(url_pattern: impl Into<String>) -> Self {
        Self::new(Some(Method::GET), url_pattern)
    }

    pub fn post(url_pattern: impl Into<String>) -> Self {
        Self::new(Some(Method::POST), url_pattern)
    }

    pub fn put(url_pattern: impl Into<String>) -> Self {
        Self::new(Some(Method::PUT), url_pattern)
    }

    pub fn delete(url_pattern: impl Into<String>) -> Self {
        Self::new(Some(Method::DELETE), url_pattern)
    }

    pub fn any(url_pattern: impl Into<String>) -> Self {
        Self::new(None, url_pattern)
    }

    /// Only match requests carrying this header value.
    pub fn match_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_predicates.push((name.into(), value.into()));
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.response.status = status;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.response.chunks = vec![body.into()];
        self
    }

    /// Deliver the body as these chunks, in order; exercises streaming.
    pub fn body_chunks(mut self, chunks: Vec<Bytes>) -> Self {
        self.response.chunks = chunks;
        self
    }

    pub fn json(mut self, value: &impl Serialize) -> Self {
        self.response.chunks = vec![Bytes::from(
            serde_json::to_vec(value).expect("mock JSON body serializes"),
        )];
        self.response
            .headers
            .push(("content-type".to_owned(), "application/json".to_owned()));
        self
    }

    pub fn set_cookie(mut self, raw: impl Into<String>) -> Self {
        self.response.set_cookies.push(raw.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.response.delay = Some(delay);
        self
    }

    /// Serve at most `n` responses, then stop matching.
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.remaining = None;
        self
    }

    /// Fail with a transport error until the n-th attempt at this mock.
    pub fn fail_until_attempt(mut self, n: u32) -> Self {
        self.fail_until_attempt = Some(n);
        self
    }

    /// Consume these failures first, one per attempt, then serve the
    /// response.
    pub fn fail_with_sequence(mut self, failures: Vec<MockFailure>) -> Self {
        self.fail_sequence = failures.into();
        self
    }

    fn matches(&self, request: &HttpRequest) -> bool {
        if let Some(method) = &self.method {
            if *method != request.method {
                return false;
            }
        }
        if !glob_match(&self.url_pattern, request.url.as_str()) {
            return false;
        }
        self.header_predicates
            .iter()
            .all(|(name, value)| request.header_str(name) == Some(value.as_str()))
    }
}

enum Decision {
    Fail(MockFailure),
    Respond(MockResponse),
}

pub struct MockTransport {
    mocks: Mutex<Vec<Mock>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            mocks: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, mock: Mock) {
        self.mocks.lock().push(mock);
    }

    pub fn clear(&self) {
        self.mocks.lock().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: &HttpRequest, _attempt: u32) -> Result<TransportResponse> {
        let decision = {
            let mut mocks = self.mocks.lock();
            let Some(mock) = mocks
                .iter_mut()
                .find(|m| m.matches(request) && m.remaining.map_or(true, |n| n > 0))
            else {
                return Err(Error::usage(format!(
                    "no mock registered for {} {}",
                    request.method, request.url
                )));
            };
            mock.attempts += 1;
            if let Some(failure) = mock.fail_sequence.pop_front() {
                Decision::Fail(failure)
            } else if mock.fail_until_attempt.is_some_and(|n| mock.attempts < n) {
                Decision::Fail(MockFailure::Transport)
            } else {
                if let Some(remaining) = mock.remaining.as_mut() {
                    *remaining -= 1;
                }
                Decision::Respond(mock.response.clone())
            }
        };
        let response = match decision {
            Decision::Fail(MockFailure::Transport) => {
                return Err(Error::transport("mocked transport failure"));
            },
            Decision::Fail(MockFailure::Timeout) => {
                return Err(Error::timeout("mocked timeout"));
            },
            Decision::Fail(MockFailure::Status(status)) => {
                let mut canned = MockResponse::new(status);
                canned.chunks = vec![Bytes::new()];
                canned
            },
            Decision::Respond(response) => response,
        };
        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }

        let status = StatusCode::from_u16(response.status)
            .map_err(|_| Error::usage(format!("invalid mock status {}", response.status)))?;
        let mut headers = HeaderMap::new();
        for (name, value) in &response.headers {
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
            {
                headers.append(name, value);
            }
        }
        for raw in &response.set_cookies {
            if let Ok(value) = raw.parse::<HeaderValue>() {
                headers.append(http::header::SET_COOKIE, value);
            }
        }
        let body = futures::stream::iter(response.chunks.into_iter().map(Ok)).boxed();
        Ok(TransportResponse {
            status,
            headers,
            version: Version::HTTP_11,
            final_url: request.url.clone(),
            body,
        })
    }
}

/// An [`HttpClient`] wired to a [`MockTransport`], with the assertion
/// surface tests use.
pub struct MockClient {
    client: HttpClient,
    transport: Arc<MockTransport>,
}

impl MockClient {
    pub fn new(handle: LoopHandle) -> Result<Self> {
        Self::with_cache_config(handle, CacheConfig::default())
    }

    pub fn with_cache_config(handle: LoopHandle, cache_config: CacheConfig) -> Result<Self> {
        let transport = Arc::new(MockTransport::new());
        let client = HttpClient::builder()
            .transport(transport.clone())
            .cache_config(cache_config)
            .build(handle)?;
        Ok(Self { client, transport })
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn transport(&self) -> Arc<MockTransport> {
        self.transport.clone()
    }

    pub fn mock(&self, mock: Mock) {
        self.transport.register(mock);
    }

    pub fn request(&self, url: impl Into<String>) -> RequestBuilder {
        self.client.request(url)
    }

    pub fn assert_request_count(&self, expected: usize) {
        let actual = self.client.history().len();
        assert_eq!(
            actual, expected,
            "expected {expected} recorded requests, found {actual}"
        );
    }

    pub fn assert_request_made(&self, method: &str, url_pattern: &str) {
        let count = self
            .client
            .history()
            .count_matching(Some(method), url_pattern);
        assert!(
            count > 0,
            "no request matching {method} {url_pattern} was recorded"
        );
    }

    pub fn assert_cookie_exists(&self, name: &str) {
        assert!(
            self.client.cookie_jar().get(name).is_some(),
            "cookie {name} not found in jar"
        );
    }

    pub fn assert_cookie_value(&self, name: &str, value: &str) {
        let cookie = self
            .client
            .cookie_jar()
            .get(name)
            .unwrap_or_else(|| panic!("cookie {name} not found in jar"));
        assert_eq!(cookie.value, value, "cookie {name} has the wrong value");
    }

    /// Clear history, mocks, cache, cookies, and downloaded files.
    pub fn reset(&self) {
        self.client.reset_state();
        self.transport.clear();
    }
}

impl From<MockFailure> for Error {
    fn from(failure: MockFailure) -> Self {
        match failure {
            MockFailure::Transport => Error::transport("mocked transport failure"),
            MockFailure::Timeout => Error::timeout("mocked timeout"),
            MockFailure::Status(status) => Error::new(
                ErrorKind::HttpStatus(status),
                format!("mocked status {status}"),
            ),
        }
    }
}
