//! The HTTP client and its request pipeline.
//!
//! Per request: builder → request interceptors → cookie attachment → cache
//! lookup → retry loop over the transport → response interceptors → cache
//! store → `Set-Cookie` ingestion. Cookie and cache mutations land before
//! the caller's promise settles.

use std::{
    path::PathBuf,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
        SystemTime,
    },
};

use bytes::Bytes;
use common::{
    Error,
    ErrorKind,
    Result,
};
use futures::TryStreamExt;
use http::{
    HeaderMap,
    HeaderName,
    HeaderValue,
    Method,
    StatusCode,
    Version,
};
use parking_lot::Mutex;
use runtime::{
    LoopHandle,
    Promise,
    WorkKind,
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::{
    cache::{
        fingerprint,
        CacheConfig,
        CacheEntry,
        Flight,
        HttpCache,
    },
    cookies::CookieJar,
    metrics,
    request::HttpRequest,
    response::HttpResponse,
    retry::RetryPolicy,
    transport::{
        ReqwestTransport,
        Transport,
    },
};

pub type RequestInterceptorFn = Arc<dyn Fn(HttpRequest) -> HttpRequest + Send + Sync>;
pub type ResponseInterceptorFn = Arc<dyn Fn(HttpResponse) -> Promise<HttpResponse> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub from_cache: bool,
}

/// Every issued request, in order, with cache hits tagged separately.
pub struct RequestHistory {
    records: Mutex<Vec<RequestRecord>>,
}

/// `*` wildcard matching for history assertions.
pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut rest = value;
    let segments: Vec<&str> = pattern.split('*').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(after) => rest = after,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(idx) => rest = &rest[idx + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

impl RequestHistory {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    fn record_transport(&self, request: &HttpRequest) {
        self.records.lock().push(RequestRecord {
            method: request.method.to_string(),
            url: request.url.to_string(),
            headers: header_pairs(&request.headers),
            from_cache: false,
        });
    }

    fn record_cache_hit(&self, request: &HttpRequest) {
        self.records.lock().push(RequestRecord {
            method: format!("{} (FROM CACHE)", request.method),
            url: request.url.to_string(),
            headers: header_pairs(&request.headers),
            from_cache: true,
        });
    }

    pub fn all(&self) -> Vec<RequestRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_matching(&self, method: Option<&str>, url_pattern: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| {
                method.map_or(true, |m| r.method == m) && glob_match(url_pattern, &r.url)
            })
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect()
}

pub(crate) struct ClientInner {
    pub handle: LoopHandle,
    pub transport: Arc<dyn Transport>,
    pub jar: Arc<CookieJar>,
    pub cache: Arc<HttpCache>,
    pub history: Arc<RequestHistory>,
    pub downloads: Mutex<Vec<PathBuf>>,
    request_interceptors: Mutex<Vec<RequestInterceptorFn>>,
    response_interceptors: Mutex<Vec<ResponseInterceptorFn>>,
    default_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

pub struct HttpClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    jar: Option<CookieJar>,
    cache_config: CacheConfig,
    default_timeout: Option<Duration>,
    request_interceptors: Vec<RequestInterceptorFn>,
    response_interceptors: Vec<ResponseInterceptorFn>,
}

impl HttpClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cookie_jar(mut self, jar: CookieJar) -> Self {
        self.jar = Some(jar);
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn intercept_request(
        mut self,
        f: impl Fn(HttpRequest) -> HttpRequest + Send + Sync + 'static,
    ) -> Self {
        self.request_interceptors.push(Arc::new(f));
        self
    }

    pub fn intercept_response(
        mut self,
        f: impl Fn(HttpResponse) -> Promise<HttpResponse> + Send + Sync + 'static,
    ) -> Self {
        self.response_interceptors.push(Arc::new(f));
        self
    }

    pub fn build(self, handle: LoopHandle) -> Result<HttpClient> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let default_timeout = self.default_timeout.or_else(|| {
            let secs = *common::knobs::HTTP_DEFAULT_TIMEOUT_SECS;
            (secs > 0).then(|| Duration::from_secs(secs))
        });
        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                handle,
                transport,
                jar: Arc::new(self.jar.unwrap_or_else(CookieJar::new)),
                cache: Arc::new(HttpCache::new(self.cache_config)),
                history: Arc::new(RequestHistory::new()),
                downloads: Mutex::new(Vec::new()),
                request_interceptors: Mutex::new(self.request_interceptors),
                response_interceptors: Mutex::new(self.response_interceptors),
                default_timeout,
            }),
        })
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder {
            transport: None,
            jar: None,
            cache_config: CacheConfig::default(),
            default_timeout: None,
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
        }
    }

    pub fn new(handle: LoopHandle) -> Result<Self> {
        Self::builder().build(handle)
    }

    pub fn request(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.inner.clone(), url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> Promise<HttpResponse> {
        self.request(url).get()
    }

    pub fn cookie_jar(&self) -> Arc<CookieJar> {
        self.inner.jar.clone()
    }

    pub fn cache(&self) -> Arc<HttpCache> {
        self.inner.cache.clone()
    }

    pub fn history(&self) -> Arc<RequestHistory> {
        self.inner.history.clone()
    }

    pub fn intercept_request(&self, f: impl Fn(HttpRequest) -> HttpRequest + Send + Sync + 'static) {
        self.inner.request_interceptors.lock().push(Arc::new(f));
    }

    pub fn intercept_response(
        &self,
        f: impl Fn(HttpResponse) -> Promise<HttpResponse> + Send + Sync + 'static,
    ) {
        self.inner.response_interceptors.lock().push(Arc::new(f));
    }

    /// Clear history, cookies, cache, and any downloaded files. Mock rules
    /// are owned by the mock transport and cleared there.
    pub fn reset_state(&self) {
        self.inner.history.clear();
        self.inner.jar.clear();
        self.inner.cache.clear();
        let downloads = std::mem::take(&mut *self.inner.downloads.lock());
        for path in downloads {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Download {
    pub file: PathBuf,
    pub bytes: u64,
}

enum BodySink {
    Buffer,
    Callback(Box<dyn FnMut(Bytes) + Send>),
    File { path: PathBuf, create_parents: bool },
}

pub struct RequestBuilder {
    client: Arc<ClientInner>,
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    cache_ttl: Option<Duration>,
    cache_vary: Vec<String>,
    cache_include_body: bool,
    use_cookie_jar: bool,
    cookies: Vec<(String, String)>,
    prefer_http2: bool,
    error_for_status: bool,
    request_interceptors: Vec<RequestInterceptorFn>,
    response_interceptors: Vec<ResponseInterceptorFn>,
    build_error: Option<Error>,
}

impl RequestBuilder {
    fn new(client: Arc<ClientInner>, url: String) -> Self {
        Self {
            client,
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
            timeout: None,
            retry: None,
            cache_ttl: None,
            cache_vary: Vec::new(),
            cache_include_body: false,
            use_cookie_jar: true,
            cookies: Vec::new(),
            prefer_http2: false,
            error_for_status: false,
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
            build_error: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.headers.push((name.into(), value.into()));
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json(mut self, value: &impl Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(encoded) => {
                self.body = Some(Bytes::from(encoded));
                self.headers
                    .push(("content-type".to_owned(), "application/json".to_owned()));
            },
            Err(e) => {
                self.build_error = Some(Error::with_cause(
                    ErrorKind::Usage,
                    "failed to encode JSON body",
                    e.into(),
                ));
            },
        }
        self
    }

    pub fn form<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in pairs {
            serializer.append_pair(name.as_ref(), value.as_ref());
        }
        self.body = Some(Bytes::from(serializer.finish()));
        self.headers.push((
            "content-type".to_owned(),
            "application/x-www-form-urlencoded".to_owned(),
        ));
        self
    }

    pub fn bearer_token(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.header("authorization", value)
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn cookies<I, K, V>(mut self, cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in cookies {
            self.cookies.push((name.into(), value.into()));
        }
        self
    }

    pub fn use_cookie_jar(mut self, use_jar: bool) -> Self {
        self.use_cookie_jar = use_jar;
        self
    }

    pub fn retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.retry = Some(RetryPolicy::new(max_attempts, base_delay));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        });
        self
    }

    pub fn cache(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn cache_vary<I, S>(mut self, header_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_vary.extend(header_names.into_iter().map(|s| s.into()));
        self
    }

    pub fn cache_include_body(mut self) -> Self {
        self.cache_include_body = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn http2(mut self) -> Self {
        self.prefer_http2 = true;
        self
    }

    pub fn error_for_status(mut self, enabled: bool) -> Self {
        self.error_for_status = enabled;
        self
    }

    pub fn intercept_request(
        mut self,
        f: impl Fn(HttpRequest) -> HttpRequest + Send + Sync + 'static,
    ) -> Self {
        self.request_interceptors.push(Arc::new(f));
        self
    }

    pub fn intercept_response(
        mut self,
        f: impl Fn(HttpResponse) -> Promise<HttpResponse> + Send + Sync + 'static,
    ) -> Self {
        self.response_interceptors.push(Arc::new(f));
        self
    }

    pub fn get(self) -> Promise<HttpResponse> {
        self.method(Method::GET).send()
    }

    pub fn post(self) -> Promise<HttpResponse> {
        self.method(Method::POST).send()
    }

    pub fn put(self) -> Promise<HttpResponse> {
        self.method(Method::PUT).send()
    }

    pub fn patch(self) -> Promise<HttpResponse> {
        self.method(Method::PATCH).send()
    }

    pub fn delete(self) -> Promise<HttpResponse> {
        self.method(Method::DELETE).send()
    }

    pub fn send(self) -> Promise<HttpResponse> {
        self.dispatch(BodySink::Buffer).map(|(response, _)| response)
    }

    /// Invoke `on_chunk` as body bytes arrive; the resolved response has an
    /// empty body.
    pub fn stream(self, on_chunk: impl FnMut(Bytes) + Send + 'static) -> Promise<HttpResponse> {
        self.dispatch(BodySink::Callback(Box::new(on_chunk)))
            .map(|(response, _)| response)
    }

    pub fn download(self, path: impl Into<PathBuf>) -> Promise<Download> {
        self.download_with_options(path, false)
    }

    pub fn download_with_options(
        self,
        path: impl Into<PathBuf>,
        create_parents: bool,
    ) -> Promise<Download> {
        let path = path.into();
        let client = self.client.clone();
        let recorded = path.clone();
        client.downloads.lock().push(recorded);
        self.dispatch(BodySink::File {
            path: path.clone(),
            create_parents,
        })
        .map(move |(_, bytes)| Download { file: path, bytes })
    }

    fn dispatch(self, sink: BodySink) -> Promise<(HttpResponse, u64)> {
        let client = self.client.clone();
        let handle = client.handle.clone();
        let guard = handle.register_work(WorkKind::Transfer);
        let cancel = Arc::new(tokio::sync::Notify::new());
        let cancelled = cancel.clone();
        let promise = handle.spawn("http_request", async move {
            let _guard = guard;
            tokio::select! {
                _ = cancelled.notified() => Err(Error::cancelled("request cancelled")),
                result = execute_request(client, self, sink) => result,
            }
        });
        promise.on_cancel(move || cancel.notify_one());
        promise
    }
}

async fn execute_request(
    client: Arc<ClientInner>,
    builder: RequestBuilder,
    mut sink: BodySink,
) -> Result<(HttpResponse, u64)> {
    if let Some(e) = builder.build_error {
        return Err(e);
    }
    metrics::log_request();

    // Build the typed request.
    let url = Url::parse(&builder.url)
        .map_err(|e| Error::with_cause(ErrorKind::Usage, "invalid request URL", e.into()))?;
    let mut request = HttpRequest::new(builder.method.clone(), url);
    for (name, value) in &builder.headers {
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::usage(format!("invalid header name: {name}")))?;
        let value: HeaderValue = value
            .parse()
            .map_err(|_| Error::usage(format!("invalid header value for {name}")))?;
        request.headers.append(name, value);
    }
    request.body = builder.body.clone();
    request.timeout = builder.timeout.or(client.default_timeout);
    request.prefer_http2 = builder.prefer_http2;

    // Request interceptors: client-level first, then per-request, in
    // registration order.
    let interceptors: Vec<RequestInterceptorFn> = client
        .request_interceptors
        .lock()
        .iter()
        .cloned()
        .chain(builder.request_interceptors.iter().cloned())
        .collect();
    for interceptor in interceptors {
        request = interceptor(request);
    }

    // Attach cookies: the jar's matches first, then explicit cookies.
    if builder.use_cookie_jar {
        let mut parts = Vec::new();
        if let Some(header) = client.jar.header_for(&request.url) {
            parts.push(header);
        }
        for (name, value) in &builder.cookies {
            parts.push(format!("{name}={value}"));
        }
        if !parts.is_empty() {
            if let Ok(value) = parts.join("; ").parse::<HeaderValue>() {
                request.headers.insert(http::header::COOKIE, value);
            }
        }
    }

    // Cache lookup. Streaming and download requests always go to transport.
    let cacheable = builder.cache_ttl.is_some() && matches!(sink, BodySink::Buffer);
    let fp = cacheable.then(|| fingerprint(&request, &builder.cache_vary, builder.cache_include_body));
    let mut flight_sender = None;
    if let Some(fp) = &fp {
        if let Some(entry) = client.cache.lookup(fp) {
            client.history.record_cache_hit(&request);
            return Ok((entry_to_response(entry, &request), 0));
        }
        match client.cache.begin_flight(fp) {
            Some(Flight::Leader(sender)) => flight_sender = Some(sender),
            Some(Flight::Follower(mut receiver)) => {
                if let Ok(Some(entry)) = receiver.recv().await {
                    client.history.record_cache_hit(&request);
                    return Ok((entry_to_response(entry, &request), 0));
                }
                // The leader failed; fall through and try the transport
                // ourselves.
            },
            None => (),
        }
    }

    // Retry loop.
    let policy = builder.retry.clone().unwrap_or_default();
    let mut backoff = policy.backoff();
    let mut attempt = 1u32;
    let outcome = loop {
        let delivered = Arc::new(AtomicU64::new(0));
        let started = Instant::now();
        let result = run_transport(&client, &request, attempt, &mut sink, &delivered).await;
        metrics::log_attempt_latency(started.elapsed());
        match result {
            Ok(outcome) => {
                if attempt < policy.max_attempts
                    && policy.is_retryable_status(outcome.0.status().as_u16())
                {
                    metrics::log_retry();
                    attempt += 1;
                    let pause = backoff.fail(&mut rand::thread_rng());
                    tokio::time::sleep(pause).await;
                    continue;
                }
                break outcome;
            },
            Err(e) => {
                let streamed = delivered.load(Ordering::SeqCst) > 0;
                if attempt < policy.max_attempts && policy.is_retryable_error(&e) && !streamed {
                    metrics::log_retry();
                    attempt += 1;
                    let pause = backoff.fail(&mut rand::thread_rng());
                    tokio::time::sleep(pause).await;
                    continue;
                }
                if let (Some(fp), Some(sender)) = (&fp, flight_sender.take()) {
                    client.cache.complete_flight(fp, sender, None);
                }
                return Err(e);
            },
        }
    };
    let (mut response, body_bytes) = outcome;

    // Response interceptors; a returned promise is adopted.
    let interceptors: Vec<ResponseInterceptorFn> = client
        .response_interceptors
        .lock()
        .iter()
        .cloned()
        .chain(builder.response_interceptors.iter().cloned())
        .collect();
    for interceptor in interceptors {
        response = interceptor(response).await?;
    }

    // Cache store: successful, buffered responses only. Failures and error
    // responses never populate the cache.
    if let Some(fp) = &fp {
        let entry = response.is_success().then(|| response_to_entry(
            &response,
            builder.cache_ttl.expect("cacheable implies a ttl"),
        ));
        if let Some(entry) = &entry {
            client.cache.store(fp, entry.clone());
        }
        if let Some(sender) = flight_sender.take() {
            client.cache.complete_flight(fp, sender, entry);
        }
    }

    // Set-Cookie ingestion.
    if builder.use_cookie_jar {
        for value in response.headers().get_all(http::header::SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                client.jar.store_from_header(raw, &request.url);
            }
        }
    }

    if builder.error_for_status && !response.is_success() {
        return Err(Error::new(
            ErrorKind::HttpStatus(response.status().as_u16()),
            format!("request to {} returned {}", request.url, response.status()),
        ));
    }

    Ok((response, body_bytes))
}

async fn run_transport(
    client: &Arc<ClientInner>,
    request: &HttpRequest,
    attempt: u32,
    sink: &mut BodySink,
    delivered: &Arc<AtomicU64>,
) -> Result<(HttpResponse, u64)> {
    client.history.record_transport(request);
    let transfer = async {
        let transport_response = client.transport.execute(request, attempt).await?;
        let status = transport_response.status;
        let headers = transport_response.headers;
        let version = transport_response.version;
        let final_url = transport_response.final_url;
        let mut body_stream = transport_response.body;

        let mut buffer = Vec::new();
        let mut file = match sink {
            BodySink::File {
                path,
                create_parents,
            } => {
                if *create_parents {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                Some(tokio::fs::File::create(&*path).await?)
            },
            _ => None,
        };
        let mut total = 0u64;
        while let Some(chunk) = body_stream.try_next().await? {
            total += chunk.len() as u64;
            delivered.fetch_add(1, Ordering::SeqCst);
            match sink {
                BodySink::Buffer => buffer.extend_from_slice(&chunk),
                BodySink::Callback(on_chunk) => on_chunk(chunk),
                BodySink::File { .. } => {
                    file.as_mut()
                        .expect("file sink opened above")
                        .write_all(&chunk)
                        .await?;
                },
            }
        }
        if let Some(mut file) = file {
            file.flush().await?;
        }
        let body = Bytes::from(buffer);
        Ok((
            HttpResponse::new(status, headers, body, version, final_url),
            total,
        ))
    };
    match request.timeout {
        Some(budget) => match tokio::time::timeout(budget, transfer).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "request to {} exceeded {budget:?}",
                request.url
            ))),
        },
        None => transfer.await,
    }
}

fn entry_to_response(entry: CacheEntry, request: &HttpRequest) -> HttpResponse {
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
            headers.append(name, value);
        }
    }
    HttpResponse::new(
        status,
        headers,
        entry.body,
        Version::HTTP_11,
        request.url.clone(),
    )
}

fn response_to_entry(response: &HttpResponse, ttl: Duration) -> CacheEntry {
    CacheEntry {
        status: response.status().as_u16(),
        headers: header_pairs(response.headers()),
        body: response.body().clone(),
        stored_at: SystemTime::now(),
        ttl,
    }
}
