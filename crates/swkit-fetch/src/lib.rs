//! # SWKit Fetch
//!
//! Fetch primitives for the swkit service-worker engine.
//!
//! ## Features
//!
//! - **Request / Response**: Cloneable value types for intercepted traffic
//! - **FetchEvent**: Event phase plus `waitUntil`-style lifetime extension
//! - **NetworkFetcher**: The seam every network access goes through
//! - **HttpFetcher**: reqwest-backed production fetcher
//! - **StubFetcher**: Canned in-memory fetcher with a call counter
//!
//! ## Architecture
//!
//! ```text
//! FetchEvent (install | activate | fetch)
//!     │
//!     ├── Request ──→ NetworkFetcher ──→ Response
//!     │                   │
//!     │                   ├── HttpFetcher (reqwest)
//!     │                   └── StubFetcher (tests, offline hosts)
//!     │
//!     └── wait_until(..) ──→ done_waiting()
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur while fetching.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ==================== Types ====================

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, distinguishing top-level navigations from subresources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin subresource.
    SameOrigin,
    /// Cross-origin subresource with CORS.
    Cors,
    /// Cross-origin subresource without CORS.
    #[default]
    NoCors,
}

/// Cache mode for the repair/install fetch.
///
/// `Reload` bypasses the HTTP cache and is used for revisioned entries,
/// where the URL alone cannot distinguish content versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestCacheMode {
    #[default]
    Default,
    Reload,
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// An intercepted HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub cache_mode: RequestCacheMode,
    pub credentials: CredentialsMode,
    /// Subresource integrity metadata, if the caller supplied any.
    pub integrity: Option<String>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::NoCors,
            cache_mode: RequestCacheMode::Default,
            credentials: CredentialsMode::SameOrigin,
            integrity: None,
        }
    }

    /// Create a navigation request.
    pub fn navigate(url: Url) -> Self {
        let mut request = Self::get(url);
        request.mode = RequestMode::Navigate;
        request
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the HTTP method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set integrity metadata.
    pub fn integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    /// Set the cache mode.
    pub fn cache_mode(mut self, mode: RequestCacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Set the credentials mode.
    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    /// Rebuild this request against a different URL, keeping headers and
    /// everything else intact.
    pub fn with_url(&self, url: Url) -> Self {
        let mut request = self.clone();
        request.url = url;
        request
    }
}

/// An HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL, when the response came off the network.
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether the network followed one or more redirects to produce this.
    pub redirected: bool,
    /// Opaque network-error response, the one state with no usable body.
    pub error: bool,
}

impl Response {
    /// Create a response with the given status and body.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            redirected: false,
            error: false,
        }
    }

    /// A 200 response.
    pub fn ok_with(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// The opaque network-error response.
    pub fn network_error() -> Self {
        Self {
            url: None,
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            redirected: false,
            error: true,
        }
    }

    /// Whether the response was successful (2xx).
    pub fn ok(&self) -> bool {
        !self.error && self.status.is_success()
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Body as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// A copy of this response with the redirect marker cleared.
    ///
    /// Stored redirected responses cannot be replayed to navigations, so
    /// the write path re-materializes them first.
    pub fn copy_without_redirect(&self) -> Self {
        let mut copy = self.clone();
        copy.redirected = false;
        copy
    }
}

// ==================== Fetch Event ====================

/// Lifecycle phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Install,
    Activate,
    Fetch,
}

/// A service-worker event.
///
/// Carries the request (for fetch events) and the lifetime-extension
/// contract: work registered through [`FetchEvent::wait_until`] must settle
/// before the host may tear the worker down, which callers enforce by
/// awaiting [`FetchEvent::done_waiting`] after the response is produced.
pub struct FetchEvent {
    pub phase: EventPhase,
    pub request: Option<Request>,
    pub client_id: Option<String>,
    pending: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl FetchEvent {
    /// Create a fetch event for an intercepted request.
    pub fn fetch(request: Request) -> Self {
        Self {
            phase: EventPhase::Fetch,
            request: Some(request),
            client_id: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Create an install or activate event.
    pub fn lifecycle(phase: EventPhase) -> Self {
        Self {
            phase,
            request: None,
            client_id: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Extend the event lifetime until `future` settles.
    pub fn wait_until(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.pending
            .lock()
            .expect("fetch event lock poisoned")
            .push(future.boxed());
    }

    /// Drain every extend-lifetime future, in registration order.
    ///
    /// New futures registered while draining are picked up too.
    pub async fn done_waiting(&self) {
        loop {
            let next = {
                let mut pending = self.pending.lock().expect("fetch event lock poisoned");
                if pending.is_empty() {
                    return;
                }
                pending.remove(0)
            };
            next.await;
        }
    }
}

impl std::fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchEvent")
            .field("phase", &self.phase)
            .field("request", &self.request)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

// ==================== Network Fetcher ====================

/// The seam every network access goes through.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Configuration for the reqwest-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("SWKit/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Production fetcher backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkFetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if request.cache_mode == RequestCacheMode::Reload {
            builder = builder.header("Cache-Control", "no-cache");
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let redirected = final_url != request.url;
        let body = response.bytes().await?;

        trace!(
            url = %final_url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(final_url),
            status,
            headers,
            body,
            redirected,
            error: false,
        })
    }
}

// ==================== Stub Fetcher ====================

enum StubOutcome {
    Response(Response),
    Error(String),
}

/// Canned in-memory fetcher.
///
/// Serves pre-registered responses keyed by exact URL and counts calls,
/// which makes "zero network fetches" assertions possible in tests and
/// lets hosts run the engine without a network at all.
#[derive(Default)]
pub struct StubFetcher {
    outcomes: Mutex<std::collections::HashMap<String, StubOutcome>>,
    calls: AtomicUsize,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `response` for `url`.
    pub fn stub(&self, url: &str, response: Response) {
        self.outcomes
            .lock()
            .expect("stub fetcher lock poisoned")
            .insert(url.to_string(), StubOutcome::Response(response));
    }

    /// Fail fetches of `url` with a network error.
    pub fn stub_error(&self, url: &str, message: &str) {
        self.outcomes
            .lock()
            .expect("stub fetcher lock poisoned")
            .insert(url.to_string(), StubOutcome::Error(message.to_string()));
    }

    /// Number of fetches performed so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NetworkFetcher for StubFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let outcomes = self.outcomes.lock().expect("stub fetcher lock poisoned");
        match outcomes.get(request.url.as_str()) {
            Some(StubOutcome::Response(response)) => {
                let mut response = response.clone();
                response.url = Some(request.url.clone());
                Ok(response)
            }
            Some(StubOutcome::Error(message)) => {
                Err(FetchError::RequestFailed(message.clone()))
            }
            None => Err(FetchError::RequestFailed(format!(
                "no stub registered for {}",
                request.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/javascript"),
            )
            .integrity("sha256-abc")
            .cache_mode(RequestCacheMode::Reload);

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.integrity.as_deref(), Some("sha256-abc"));
        assert_eq!(request.cache_mode, RequestCacheMode::Reload);
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigation_request() {
        let url = Url::parse("https://example.com/").unwrap();
        assert!(Request::navigate(url).is_navigation());
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_network_error_response() {
        let response = Response::network_error();
        assert!(response.error);
        assert!(!response.ok());
    }

    #[test]
    fn test_copy_without_redirect() {
        let mut response = Response::ok_with("body");
        response.redirected = true;
        let copy = response.copy_without_redirect();
        assert!(!copy.redirected);
        assert_eq!(copy.body, response.body);
    }

    #[tokio::test]
    async fn test_stub_fetcher_counts_calls() {
        let fetcher = StubFetcher::new();
        let url = Url::parse("https://example.com/a.css").unwrap();
        fetcher.stub(url.as_str(), Response::ok_with("css"));

        assert_eq!(fetcher.call_count(), 0);
        let response = fetcher.fetch(&Request::get(url.clone())).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(fetcher.call_count(), 1);

        let missing = Url::parse("https://example.com/missing.css").unwrap();
        assert!(fetcher.fetch(&Request::get(missing)).await.is_err());
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_event_done_waiting_drains_in_order() {
        use std::sync::Arc;

        let event = FetchEvent::fetch(Request::get(
            Url::parse("https://example.com/").unwrap(),
        ));
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            event.wait_until(async move {
                order.lock().unwrap().push(tag);
            });
        }
        event.done_waiting().await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
