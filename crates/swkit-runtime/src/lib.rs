//! # SWKit Runtime
//!
//! The service-worker runtime context and its request dispatcher.
//!
//! ## Features
//!
//! - **ServiceWorkerRuntime**: one explicit context object holding the
//!   registry, router, lifecycle manager, caches, fetcher, and SSR app,
//!   with no worker globals, so everything is unit-testable
//! - **Lifecycle**: install / activate drivers with the worker state
//!   machine
//! - **Dispatch**: every fetch event resolves to a response; worst case
//!   is a transparent network passthrough
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerRuntime
//!     │
//!     ├── handle_install ──→ PrecacheLifecycle::install
//!     ├── handle_activate ─→ PrecacheLifecycle::activate
//!     │
//!     └── handle_fetch
//!             ├── navigation + manifest match ──→ SsrApp::render
//!             ├── navigation, no match ─────────→ network
//!             └── subresource ──→ Router (precache route first)
//!                                     └── fallback ──→ network
//! ```

use std::sync::Arc;

use http::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use swkit_cache::{CacheNameConfig, CacheStorage};
use swkit_fetch::{
    FetchEvent, FetchError, HttpFetcher, HttpFetcherConfig, NetworkFetcher, Request, Response,
};
use swkit_precache::{
    InstallReport, ActivateReport, PrecacheEntry, PrecacheError, PrecacheLifecycle,
    PrecacheRegistry, PrecacheStrategy, UrlVariationConfig,
};
use swkit_routing::{Handler, Route, Router};
use swkit_ssr::{RenderBackend, RouteManifest, SsrApp};

// ==================== Errors ====================

/// Errors raised by the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Precache error: {0}")]
    Precache(#[from] PrecacheError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("A route manifest was supplied without a render backend")]
    MissingRenderBackend,

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),
}

// ==================== Worker State ====================

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Script evaluated, nothing driven yet.
    #[default]
    Parsed,
    /// Install in progress.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate in progress.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed; this version must never control pages.
    Redundant,
}

// ==================== Config ====================

/// Runtime behavior flags, carried from the build integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Request immediate activation instead of waiting for old workers.
    pub skip_waiting: bool,
    /// Request control of already-open pages on activation.
    pub clients_claim: bool,
    /// Cache naming scheme. An empty suffix is filled from the scope.
    pub cache_names: CacheNameConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            skip_waiting: false,
            clients_claim: false,
            cache_names: CacheNameConfig::default(),
        }
    }
}

// ==================== Runtime ====================

/// The worker's single context object.
///
/// Construct once per worker instantiation via [`ServiceWorkerRuntime::builder`];
/// the host wires `handle_install`, `handle_activate`, and `handle_fetch`
/// to its lifecycle and fetch interception events.
pub struct ServiceWorkerRuntime {
    scope: Url,
    config: RuntimeConfig,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn NetworkFetcher>,
    lifecycle: PrecacheLifecycle,
    router: Router,
    app: Option<SsrApp>,
    state: RwLock<WorkerState>,
}

impl ServiceWorkerRuntime {
    pub fn builder(scope: Url) -> RuntimeBuilder {
        RuntimeBuilder::new(scope)
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<RwLock<CacheStorage>> {
        &self.caches
    }

    pub fn lifecycle(&self) -> &PrecacheLifecycle {
        &self.lifecycle
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Drive the install transition: populate the precache.
    ///
    /// A failure marks this worker version redundant; the host must not
    /// activate it.
    pub async fn handle_install(&self) -> Result<InstallReport, RuntimeError> {
        {
            let mut state = self.state.write().await;
            if *state == WorkerState::Redundant {
                return Err(RuntimeError::InvalidState(
                    "redundant worker cannot install".to_string(),
                ));
            }
            *state = WorkerState::Installing;
        }
        info!(scope = %self.scope, "Service worker installing");

        match self
            .lifecycle
            .install(Arc::clone(&self.caches), Arc::clone(&self.fetcher))
            .await
        {
            Ok(report) => {
                *self.state.write().await = WorkerState::Installed;
                if self.config.skip_waiting {
                    debug!("Skip-waiting requested; host may activate immediately");
                }
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, "Install failed; marking worker redundant");
                *self.state.write().await = WorkerState::Redundant;
                Err(err.into())
            }
        }
    }

    /// Drive the activate transition: evict stale precache entries.
    pub async fn handle_activate(&self) -> Result<ActivateReport, RuntimeError> {
        {
            let mut state = self.state.write().await;
            if *state == WorkerState::Redundant {
                return Err(RuntimeError::InvalidState(
                    "redundant worker cannot activate".to_string(),
                ));
            }
            *state = WorkerState::Activating;
        }

        let report = self.lifecycle.activate(Arc::clone(&self.caches)).await;
        *self.state.write().await = WorkerState::Activated;
        info!(
            scope = %self.scope,
            deleted = report.deleted_urls.len(),
            "Service worker activated"
        );
        if self.config.clients_claim {
            debug!("Clients-claim requested; host should claim open pages");
        }
        Ok(report)
    }

    /// Handle one intercepted request. Always resolves to a response
    /// (worst case a transparent network passthrough) and does not
    /// return before every extend-lifetime future has settled, so no
    /// cache write is abandoned mid-flight.
    pub async fn handle_fetch(&self, request: Request) -> Response {
        let event = Arc::new(FetchEvent::fetch(request.clone()));
        let response = self.respond(&request, &event).await;
        event.done_waiting().await;
        response
    }

    async fn respond(&self, request: &Request, event: &Arc<FetchEvent>) -> Response {
        if request.is_navigation() {
            if let Some(app) = &self.app {
                if let Some(route) = app.match_request(request) {
                    match app.render(request, Some(route)).await {
                        Ok(response) => return response,
                        Err(err) => {
                            warn!(url = %request.url, error = %err, "Render failed, falling back to the network");
                            return self.network_fallback(request).await;
                        }
                    }
                }
                return self.network_fallback(request).await;
            }
        }

        match self.router.handle_request(request, event).await {
            Some(Ok(response)) => response,
            Some(Err(err)) => {
                warn!(url = %request.url, error = %err, "Unhandled route error, falling back to the network");
                self.network_fallback(request).await
            }
            None => self.network_fallback(request).await,
        }
    }

    async fn network_fallback(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %request.url, error = %err, "Network fallback failed");
                Response::network_error()
            }
        }
    }
}

// ==================== Builder ====================

/// Wires a [`ServiceWorkerRuntime`] together. The precache route is
/// registered ahead of every user route, so static assets never fall
/// through to SSR matching.
pub struct RuntimeBuilder {
    scope: Url,
    config: RuntimeConfig,
    caches: Option<Arc<RwLock<CacheStorage>>>,
    fetcher: Option<Arc<dyn NetworkFetcher>>,
    precache_entries: Vec<PrecacheEntry>,
    variations: UrlVariationConfig,
    manifest: Option<RouteManifest>,
    render_backend: Option<Arc<dyn RenderBackend>>,
    routes: Vec<Route>,
    default_handlers: Vec<(Method, Arc<dyn Handler>)>,
    catch_handler: Option<Arc<dyn Handler>>,
}

impl RuntimeBuilder {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            config: RuntimeConfig::default(),
            caches: None,
            fetcher: None,
            precache_entries: Vec::new(),
            variations: UrlVariationConfig::default(),
            manifest: None,
            render_backend: None,
            routes: Vec::new(),
            default_handlers: Vec::new(),
            catch_handler: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn caches(mut self, caches: Arc<RwLock<CacheStorage>>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn NetworkFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Add precache entries from the build's asset list.
    pub fn precache<I, E>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<PrecacheEntry>,
    {
        self.precache_entries.extend(entries.into_iter().map(Into::into));
        self
    }

    pub fn url_variations(mut self, variations: UrlVariationConfig) -> Self {
        self.variations = variations;
        self
    }

    /// Supply the SSR route manifest. Excluded routes are expected to be
    /// absent from it already.
    pub fn manifest(mut self, manifest: RouteManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn render_backend(mut self, backend: Arc<dyn RenderBackend>) -> Self {
        self.render_backend = Some(backend);
        self
    }

    /// Register a runtime route, after the precache route.
    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn default_handler(mut self, method: Method, handler: Arc<dyn Handler>) -> Self {
        self.default_handlers.push((method, handler));
        self
    }

    pub fn catch_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.catch_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<ServiceWorkerRuntime, RuntimeError> {
        let mut config = self.config;
        if config.cache_names.suffix.is_empty() {
            config.cache_names.suffix = self.scope.to_string();
        }

        let caches = self
            .caches
            .unwrap_or_else(|| Arc::new(RwLock::new(CacheStorage::new())));
        let fetcher: Arc<dyn NetworkFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(HttpFetcherConfig::default())?),
        };

        let mut registry = PrecacheRegistry::new(self.scope.clone());
        registry.add_entries(self.precache_entries)?;
        let registry = Arc::new(registry);

        let strategy = Arc::new(PrecacheStrategy::new(
            config.cache_names.precache_name(),
            Arc::clone(&registry),
        ));
        let lifecycle = PrecacheLifecycle::new(registry, strategy);

        let mut router = Router::new(self.scope.clone());
        router.register_route(lifecycle.as_route(
            Arc::clone(&caches),
            Arc::clone(&fetcher),
            Arc::new(self.variations),
        ));
        for route in self.routes {
            router.register_route(route);
        }
        for (method, handler) in self.default_handlers {
            router.set_default_handler(handler, method);
        }
        if let Some(handler) = self.catch_handler {
            router.set_catch_handler(handler);
        }

        let app = match (self.manifest, self.render_backend) {
            (Some(manifest), Some(backend)) => Some(SsrApp::new(manifest, backend)),
            (Some(_), None) => return Err(RuntimeError::MissingRenderBackend),
            (None, backend) => {
                if backend.is_some() {
                    debug!("Render backend supplied without a manifest; SSR disabled");
                }
                None
            }
        };

        Ok(ServiceWorkerRuntime {
            scope: self.scope,
            config,
            caches,
            fetcher,
            lifecycle,
            router,
            app,
            state: RwLock::new(WorkerState::Parsed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use regex::Regex;
    use swkit_precache::{CacheFirst, Strategy, StrategyHandle};
    use swkit_routing::RouteMatcher;
    use swkit_fetch::StubFetcher;
    use swkit_ssr::RouteData;

    const MANIFEST: &str = r#"{
        "routes": [
            {
                "pattern": "^\\/$",
                "params": [],
                "component": "src/pages/index.js",
                "pathname": "/",
                "type": "page"
            }
        ],
        "assets": []
    }"#;

    struct EchoBackend;

    #[async_trait]
    impl RenderBackend for EchoBackend {
        async fn render(&self, _request: &Request, route: &RouteData) -> anyhow::Result<Response> {
            Ok(Response::ok_with(format!("rendered:{}", route.component)))
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl RenderBackend for FailingBackend {
        async fn render(&self, _request: &Request, _route: &RouteData) -> anyhow::Result<Response> {
            Err(anyhow::anyhow!("renderer exploded"))
        }
    }

    fn scope() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    fn navigate(url: &str) -> Request {
        Request::navigate(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_install_activate_fetch_roundtrip() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.stub("https://example.com/app.js", Response::ok_with("js"));

        let runtime = ServiceWorkerRuntime::builder(scope())
            .fetcher(fetcher.clone())
            .precache([PrecacheEntry::new("/app.js").revision("r1")])
            .build()
            .unwrap();

        assert_eq!(runtime.state().await, WorkerState::Parsed);
        let report = runtime.handle_install().await.unwrap();
        assert_eq!(report.updated_urls.len(), 1);
        assert_eq!(runtime.state().await, WorkerState::Installed);

        runtime.handle_activate().await.unwrap();
        assert_eq!(runtime.state().await, WorkerState::Activated);
        assert_eq!(fetcher.call_count(), 1);

        // Serving the precached asset issues no further network calls.
        let response = runtime.handle_fetch(get("https://example.com/app.js")).await;
        assert_eq!(response.text(), "js");
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_activate_purges_previous_deployment() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.stub("https://example.com/app.js", Response::ok_with("v2"));

        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let runtime = ServiceWorkerRuntime::builder(scope())
            .caches(Arc::clone(&caches))
            .fetcher(fetcher)
            .precache([PrecacheEntry::new("/app.js").revision("r2")])
            .build()
            .unwrap();

        let precache_name = runtime.config().cache_names.precache_name();
        caches
            .write()
            .await
            .put(
                &precache_name,
                "https://example.com/app.js?__WB_REVISION__=r1",
                Response::ok_with("v1"),
            )
            .unwrap();

        runtime.handle_install().await.unwrap();
        let report = runtime.handle_activate().await.unwrap();

        assert_eq!(
            report.deleted_urls,
            vec!["https://example.com/app.js?__WB_REVISION__=r1".to_string()]
        );
        let storage = caches.read().await;
        assert_eq!(storage.get(&precache_name).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_marks_worker_redundant() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.stub_error("https://example.com/app.js", "offline");

        let runtime = ServiceWorkerRuntime::builder(scope())
            .fetcher(fetcher)
            .precache([PrecacheEntry::new("/app.js").revision("r1")])
            .build()
            .unwrap();

        assert!(runtime.handle_install().await.is_err());
        assert_eq!(runtime.state().await, WorkerState::Redundant);
        assert!(matches!(
            runtime.handle_activate().await,
            Err(RuntimeError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_navigation_renders_matched_route() {
        let runtime = ServiceWorkerRuntime::builder(scope())
            .fetcher(Arc::new(StubFetcher::new()))
            .manifest(RouteManifest::from_json(MANIFEST).unwrap())
            .render_backend(Arc::new(EchoBackend))
            .build()
            .unwrap();

        let response = runtime.handle_fetch(navigate("https://example.com/")).await;
        assert_eq!(response.text(), "rendered:src/pages/index.js");
    }

    #[tokio::test]
    async fn test_unmatched_navigation_goes_to_network() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.stub("https://example.com/elsewhere", Response::ok_with("origin"));

        let runtime = ServiceWorkerRuntime::builder(scope())
            .fetcher(fetcher.clone())
            .manifest(RouteManifest::from_json(MANIFEST).unwrap())
            .render_backend(Arc::new(EchoBackend))
            .build()
            .unwrap();

        let response = runtime
            .handle_fetch(navigate("https://example.com/elsewhere"))
            .await;
        assert_eq!(response.text(), "origin");
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_render_failure_degrades_to_network() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.stub("https://example.com/", Response::ok_with("static fallback"));

        let runtime = ServiceWorkerRuntime::builder(scope())
            .fetcher(fetcher)
            .manifest(RouteManifest::from_json(MANIFEST).unwrap())
            .render_backend(Arc::new(FailingBackend))
            .build()
            .unwrap();

        let response = runtime.handle_fetch(navigate("https://example.com/")).await;
        assert_eq!(response.text(), "static fallback");
    }

    #[tokio::test]
    async fn test_every_fetch_is_answered() {
        // No stubs at all: precache empty, no SSR, network failing.
        let runtime = ServiceWorkerRuntime::builder(scope())
            .fetcher(Arc::new(StubFetcher::new()))
            .build()
            .unwrap();

        let response = runtime
            .handle_fetch(get("https://example.com/unknown.bin"))
            .await;
        assert!(response.error);

        let response = runtime
            .handle_fetch(navigate("https://example.com/unknown-page"))
            .await;
        assert!(response.error);
    }

    #[tokio::test]
    async fn test_runtime_route_with_cache_first() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.stub(
            "https://fonts.example.net/inter.woff2",
            Response::ok_with("font"),
        );

        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let cache_first: Arc<dyn Strategy> = Arc::new(CacheFirst::new("swkit-runtime"));
        let route = Route::new(
            RouteMatcher::Pattern(Regex::new(r"^https://fonts\.example\.net/").unwrap()),
            Arc::new(StrategyHandle::new(
                cache_first,
                Arc::clone(&caches),
                fetcher.clone(),
            )),
        );

        let runtime = ServiceWorkerRuntime::builder(scope())
            .caches(caches)
            .fetcher(fetcher.clone())
            .route(route)
            .build()
            .unwrap();

        let url = "https://fonts.example.net/inter.woff2";
        assert_eq!(runtime.handle_fetch(get(url)).await.text(), "font");
        assert_eq!(fetcher.call_count(), 1);

        // Second hit is served from the runtime cache.
        assert_eq!(runtime.handle_fetch(get(url)).await.text(), "font");
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_manifest_without_backend_rejected() {
        let result = ServiceWorkerRuntime::builder(scope())
            .fetcher(Arc::new(StubFetcher::new()))
            .manifest(RouteManifest::from_json(MANIFEST).unwrap())
            .build();
        assert!(matches!(result, Err(RuntimeError::MissingRenderBackend)));
    }

    #[tokio::test]
    async fn test_conflicting_precache_entries_fail_construction() {
        let result = ServiceWorkerRuntime::builder(scope())
            .fetcher(Arc::new(StubFetcher::new()))
            .precache([
                PrecacheEntry::new("/a.js").revision("r1"),
                PrecacheEntry::new("/a.js").revision("r2"),
            ])
            .build();
        assert!(matches!(
            result,
            Err(RuntimeError::Precache(PrecacheError::ConflictingEntry { .. }))
        ));
    }

    #[tokio::test]
    async fn test_scope_fills_cache_name_suffix() {
        let runtime = ServiceWorkerRuntime::builder(scope())
            .fetcher(Arc::new(StubFetcher::new()))
            .build()
            .unwrap();
        assert_eq!(
            runtime.config().cache_names.precache_name(),
            "swkit-precache-v2-https://example.com/"
        );
    }
}
