//! Caching strategies: the policies that decide how a request meets the
//! cache and the network.
//!
//! [`PrecacheStrategy`] is the engine's core policy. It behaves
//! differently per event phase: during install it always fetches and the
//! write must succeed; in steady state it serves the cache and only
//! touches the network as a fallback, repairing the cache when the
//! registry vouches for the response via integrity metadata.
//!
//! Extension points are the typed, optional capabilities on
//! [`StrategyPlugin`], consulted in a fixed order; nothing is located by
//! probing for method names.

use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use swkit_cache::{CacheError, CacheStorage};
use swkit_fetch::{EventPhase, FetchEvent, NetworkFetcher, Request, Response};
use swkit_routing::{Handler, HandlerContext, MatchParams};

use crate::registry::PrecacheRegistry;
use crate::PrecacheError;

// ==================== Plugins ====================

/// Whether a cache key is being derived for a read or a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeyMode {
    Read,
    Write,
}

/// Decision from a [`StrategyPlugin::cache_will_update`] capability.
pub enum CacheUpdateDecision {
    /// Capability not implemented; ask the next plugin.
    Unhandled,
    /// Cache the response as-is. Ends the chain.
    Keep,
    /// Do not cache this response. Ends the chain.
    Skip,
    /// Substitute a replacement response and continue the chain.
    Replace(Response),
}

/// Typed extension points on the strategy pipeline.
///
/// Every capability is optional; plugins are consulted in registration
/// order, built-in plugins after user plugins.
pub trait StrategyPlugin: Send + Sync {
    /// Rewrite the request whose URL becomes the storage key, decoupling
    /// the request URL from the cache key.
    fn cache_key_will_be_used(
        &self,
        _request: &Request,
        _mode: CacheKeyMode,
        _params: Option<&MatchParams>,
    ) -> Option<Request> {
        None
    }

    /// Observe, replace, or veto the cached response about to be used.
    /// `original` is the request as it entered the strategy, before any
    /// cache-key rewrite.
    fn cached_response_will_be_used(
        &self,
        _phase: EventPhase,
        _original: &Request,
        cached: Option<Response>,
    ) -> Option<Response> {
        cached
    }

    /// Decide whether a response may enter the cache.
    fn cache_will_update(&self, _request: &Request, _response: &Response) -> CacheUpdateDecision {
        CacheUpdateDecision::Unhandled
    }
}

/// Rewrites requests to the registry's canonical cache key. An explicit
/// cache key in the match params wins over the registry lookup.
struct PrecacheKeyPlugin {
    registry: Arc<PrecacheRegistry>,
}

impl StrategyPlugin for PrecacheKeyPlugin {
    fn cache_key_will_be_used(
        &self,
        request: &Request,
        _mode: CacheKeyMode,
        params: Option<&MatchParams>,
    ) -> Option<Request> {
        let cache_key = params
            .and_then(|p| p.cache_key.clone())
            .or_else(|| self.registry.get_cache_key_for_url(request.url.as_str()))?;
        let url = self.registry.base().join(&cache_key).ok()?;
        Some(request.with_url(url))
    }
}

/// Re-materializes redirected responses before they enter the cache.
struct RedirectCopyPlugin;

impl StrategyPlugin for RedirectCopyPlugin {
    fn cache_will_update(&self, _request: &Request, response: &Response) -> CacheUpdateDecision {
        if response.redirected {
            CacheUpdateDecision::Replace(response.copy_without_redirect())
        } else {
            CacheUpdateDecision::Unhandled
        }
    }
}

/// Precaching accepts any response below 400, unless a user plugin
/// decided first.
struct DefaultCacheabilityPlugin;

impl StrategyPlugin for DefaultCacheabilityPlugin {
    fn cache_will_update(&self, _request: &Request, response: &Response) -> CacheUpdateDecision {
        if response.status.as_u16() < 400 {
            CacheUpdateDecision::Keep
        } else {
            CacheUpdateDecision::Skip
        }
    }
}

// ==================== Strategy Context & Handler ====================

/// Shared collaborators a strategy runs against.
#[derive(Clone)]
pub struct StrategyContext {
    pub caches: Arc<RwLock<CacheStorage>>,
    pub fetcher: Arc<dyn NetworkFetcher>,
    pub event: Arc<FetchEvent>,
}

impl StrategyContext {
    pub fn new(
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn NetworkFetcher>,
        event: Arc<FetchEvent>,
    ) -> Self {
        Self {
            caches,
            fetcher,
            event,
        }
    }
}

/// Per-request execution state shared by the strategies: plugin-aware
/// cache reads and writes, and the network reach.
pub(crate) struct StrategyHandler<'a> {
    cache_name: &'a str,
    plugins: Vec<&'a dyn StrategyPlugin>,
    cx: &'a StrategyContext,
    params: Option<&'a MatchParams>,
}

impl<'a> StrategyHandler<'a> {
    fn new(
        cache_name: &'a str,
        plugins: Vec<&'a dyn StrategyPlugin>,
        cx: &'a StrategyContext,
        params: Option<&'a MatchParams>,
    ) -> Self {
        Self {
            cache_name,
            plugins,
            cx,
            params,
        }
    }

    /// The request whose URL is used as the storage key.
    fn effective_request(&self, request: &Request, mode: CacheKeyMode) -> Request {
        let mut effective = request.clone();
        for plugin in &self.plugins {
            if let Some(rewritten) = plugin.cache_key_will_be_used(&effective, mode, self.params) {
                effective = rewritten;
            }
        }
        effective
    }

    async fn fetch(&self, request: &Request) -> Result<Response, PrecacheError> {
        let response = self.cx.fetcher.fetch(request).await?;
        if response.error {
            return Err(PrecacheError::NoResponse {
                url: request.url.to_string(),
            });
        }
        Ok(response)
    }

    async fn cache_match(&self, request: &Request) -> Option<Response> {
        let effective = self.effective_request(request, CacheKeyMode::Read);
        let mut cached = self
            .cx
            .caches
            .read()
            .await
            .get(self.cache_name)
            .and_then(|cache| cache.match_url(effective.url.as_str()));

        if cached.is_some() {
            trace!(cache = %self.cache_name, url = %effective.url, "Cache hit");
        }
        for plugin in &self.plugins {
            cached = plugin.cached_response_will_be_used(self.cx.event.phase, request, cached);
        }
        cached
    }

    /// Write `response` under the request's effective cache key.
    ///
    /// Returns `Ok(false)` when a plugin vetoed the write. A
    /// quota-exceeded write runs the registered relief callbacks once,
    /// then the error still propagates to the caller.
    async fn cache_put(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<bool, PrecacheError> {
        let effective = self.effective_request(request, CacheKeyMode::Write);
        if effective.method != Method::GET {
            return Err(PrecacheError::AttemptToCacheNonGetRequest {
                url: effective.url.to_string(),
                method: effective.method.to_string(),
            });
        }
        if response.error {
            return Err(PrecacheError::CachePutWithNoResponse {
                url: effective.url.to_string(),
            });
        }

        let Some(to_cache) = self.ensure_response_safe_to_cache(request, response) else {
            debug!(url = %effective.url, "Response not cacheable, skipping write");
            return Ok(false);
        };

        let mut caches = self.cx.caches.write().await;
        match caches.put(self.cache_name, effective.url.as_str(), to_cache) {
            Ok(()) => Ok(true),
            Err(err @ CacheError::QuotaExceeded { .. }) => {
                warn!(cache = %self.cache_name, url = %effective.url, error = %err, "Cache write hit quota");
                caches.run_quota_error_callbacks();
                Err(err.into())
            }
        }
    }

    /// Run the `cache_will_update` chain; `None` means do not cache.
    /// With no deciding plugin, only 200 responses are cacheable.
    fn ensure_response_safe_to_cache(
        &self,
        request: &Request,
        response: Response,
    ) -> Option<Response> {
        let mut current = response;
        for plugin in &self.plugins {
            match plugin.cache_will_update(request, &current) {
                CacheUpdateDecision::Unhandled => continue,
                CacheUpdateDecision::Keep => return Some(current),
                CacheUpdateDecision::Skip => return None,
                CacheUpdateDecision::Replace(replacement) => current = replacement,
            }
        }
        (current.status == http::StatusCode::OK).then_some(current)
    }
}

// ==================== Strategy Trait ====================

/// A routable caching policy.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn cache_name(&self) -> &str;

    async fn handle(
        &self,
        cx: &StrategyContext,
        request: Request,
        params: Option<&MatchParams>,
    ) -> Result<Response, PrecacheError>;
}

/// Adapter binding a strategy to its storage and fetcher so the router
/// can drive it as a plain [`Handler`].
pub struct StrategyHandle {
    strategy: Arc<dyn Strategy>,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn NetworkFetcher>,
}

impl StrategyHandle {
    pub fn new(
        strategy: Arc<dyn Strategy>,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn NetworkFetcher>,
    ) -> Self {
        Self {
            strategy,
            caches,
            fetcher,
        }
    }
}

#[async_trait]
impl Handler for StrategyHandle {
    async fn handle(&self, cx: HandlerContext) -> anyhow::Result<Response> {
        let strategy_cx = StrategyContext::new(
            Arc::clone(&self.caches),
            Arc::clone(&self.fetcher),
            Arc::clone(&cx.event),
        );
        Ok(self
            .strategy
            .handle(&strategy_cx, cx.request, cx.params.as_ref())
            .await?)
    }
}

// ==================== Precache Strategy ====================

/// Cache-then-network with install-time population and steady-state
/// repair.
pub struct PrecacheStrategy {
    cache_name: String,
    fallback_to_network: bool,
    plugins: Vec<Arc<dyn StrategyPlugin>>,
    key_plugin: PrecacheKeyPlugin,
    redirect_copy: RedirectCopyPlugin,
    default_cacheability: DefaultCacheabilityPlugin,
}

impl PrecacheStrategy {
    pub fn new(cache_name: impl Into<String>, registry: Arc<PrecacheRegistry>) -> Self {
        Self {
            cache_name: cache_name.into(),
            fallback_to_network: true,
            plugins: Vec::new(),
            key_plugin: PrecacheKeyPlugin { registry },
            redirect_copy: RedirectCopyPlugin,
            default_cacheability: DefaultCacheabilityPlugin,
        }
    }

    /// Whether a steady-state cache miss may fall back to the network.
    /// Defaults to true; disabling turns a miss into
    /// [`PrecacheError::MissingPrecacheEntry`].
    pub fn fallback_to_network(mut self, fallback: bool) -> Self {
        self.fallback_to_network = fallback;
        self
    }

    /// Add a user plugin. User plugins run before the built-in ones.
    pub fn plugin(mut self, plugin: Arc<dyn StrategyPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub(crate) async fn handle_with_plugins(
        &self,
        cx: &StrategyContext,
        request: Request,
        params: Option<&MatchParams>,
        extra: &[Arc<dyn StrategyPlugin>],
    ) -> Result<Response, PrecacheError> {
        let mut plugins: Vec<&dyn StrategyPlugin> =
            self.plugins.iter().map(|plugin| plugin.as_ref()).collect();
        plugins.push(&self.key_plugin);
        plugins.push(&self.redirect_copy);
        plugins.push(&self.default_cacheability);
        plugins.extend(extra.iter().map(|plugin| plugin.as_ref()));

        let handler = StrategyHandler::new(&self.cache_name, plugins, cx, params);

        if let Some(cached) = handler.cache_match(&request).await {
            return Ok(cached);
        }
        if cx.event.phase == EventPhase::Install {
            self.handle_install(&handler, request).await
        } else {
            self.handle_fetch(&handler, request, params).await
        }
    }

    /// Install phase: fetch unconditionally; the write must land.
    async fn handle_install(
        &self,
        handler: &StrategyHandler<'_>,
        request: Request,
    ) -> Result<Response, PrecacheError> {
        let response = handler.fetch(&request).await?;
        let status = response.status.as_u16();
        let was_cached = handler.cache_put(&request, response.clone()).await?;
        if !was_cached {
            return Err(PrecacheError::BadPrecachingResponse {
                url: request.url.to_string(),
                status,
            });
        }
        Ok(response)
    }

    /// Steady-state miss: fall back to the network if permitted, and
    /// repair the cache when the registry vouches for the response.
    async fn handle_fetch(
        &self,
        handler: &StrategyHandler<'_>,
        request: Request,
        params: Option<&MatchParams>,
    ) -> Result<Response, PrecacheError> {
        if !self.fallback_to_network {
            return Err(PrecacheError::MissingPrecacheEntry {
                cache_name: self.cache_name.clone(),
                url: request.url.to_string(),
            });
        }
        warn!(
            cache = %self.cache_name,
            url = %request.url,
            "Precached response missing, falling back to the network"
        );

        let manifest_integrity = params.and_then(|p| p.integrity.clone());
        let request_integrity = request.integrity.clone();
        let no_integrity_conflict =
            request_integrity.is_none() || request_integrity == manifest_integrity;

        let mut fetch_request = request.clone();
        fetch_request.integrity = request_integrity.or_else(|| manifest_integrity.clone());
        let response = handler.fetch(&fetch_request).await?;

        if manifest_integrity.is_some() && no_integrity_conflict {
            let was_cached = handler.cache_put(&request, response.clone()).await?;
            if was_cached {
                debug!(url = %request.url, "Repaired the precache from the network");
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl Strategy for PrecacheStrategy {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    async fn handle(
        &self,
        cx: &StrategyContext,
        request: Request,
        params: Option<&MatchParams>,
    ) -> Result<Response, PrecacheError> {
        self.handle_with_plugins(cx, request, params, &[]).await
    }
}

// ==================== Cache First ====================

/// Runtime cache-first policy: serve the cache, else fetch and remember.
///
/// The cache write is deferred onto the event's extended lifetime, so the
/// response goes out before the write lands.
pub struct CacheFirst {
    cache_name: String,
    plugins: Vec<Arc<dyn StrategyPlugin>>,
}

impl CacheFirst {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            plugins: Vec::new(),
        }
    }

    pub fn plugin(mut self, plugin: Arc<dyn StrategyPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }
}

#[async_trait]
impl Strategy for CacheFirst {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    async fn handle(
        &self,
        cx: &StrategyContext,
        request: Request,
        params: Option<&MatchParams>,
    ) -> Result<Response, PrecacheError> {
        let plugins: Vec<&dyn StrategyPlugin> =
            self.plugins.iter().map(|plugin| plugin.as_ref()).collect();
        let handler = StrategyHandler::new(&self.cache_name, plugins, cx, params);

        if let Some(cached) = handler.cache_match(&request).await {
            return Ok(cached);
        }
        let response = handler.fetch(&request).await?;

        let effective = handler.effective_request(&request, CacheKeyMode::Write);
        if effective.method == Method::GET && !response.error {
            if let Some(to_cache) =
                handler.ensure_response_safe_to_cache(&request, response.clone())
            {
                let caches = Arc::clone(&cx.caches);
                let cache_name = self.cache_name.clone();
                let key = effective.url.to_string();
                cx.event.wait_until(async move {
                    let mut caches = caches.write().await;
                    if let Err(err) = caches.put(&cache_name, &key, to_cache) {
                        warn!(cache = %cache_name, url = %key, error = %err, "Deferred cache write failed");
                        caches.run_quota_error_callbacks();
                    }
                });
            }
        }
        Ok(response)
    }
}
