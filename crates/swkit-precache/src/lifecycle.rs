//! Install/activate orchestration for the precache.
//!
//! `install` populates the versioned cache from the registry and must
//! settle every entry before the install event finishes; a single bad
//! response fails the whole transition, so a broken deployment never
//! becomes the active worker. `activate` diffs the stored keys against
//! the registry and deletes everything the current build no longer
//! ships; the "exactly this build's assets are cached" guarantee rests
//! on that diff.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

use swkit_cache::CacheStorage;
use swkit_fetch::{CredentialsMode, EventPhase, FetchEvent, NetworkFetcher, Request, Response};
use swkit_routing::{Handler, HandlerContext, MatchParams, Route, RouteMatcher};

use crate::cache_key::{url_variations, UrlVariationConfig};
use crate::registry::PrecacheRegistry;
use crate::strategy::{PrecacheStrategy, Strategy, StrategyContext, StrategyHandle, StrategyPlugin};
use crate::PrecacheError;

// ==================== Reports ====================

/// Which URLs an install actually wrote, versus found already resident.
/// Diagnostic only; scoped to one install event.
#[derive(Debug, Default, Clone)]
pub struct InstallReport {
    pub updated_urls: Vec<String>,
    pub not_updated_urls: Vec<String>,
}

/// Which stale cache keys an activation purged.
#[derive(Debug, Default, Clone)]
pub struct ActivateReport {
    pub deleted_urls: Vec<String>,
}

/// Collects the install report off the cache-probe hook.
#[derive(Default)]
struct InstallReportPlugin {
    updated: Mutex<Vec<String>>,
    not_updated: Mutex<Vec<String>>,
}

impl InstallReportPlugin {
    fn into_report(self: Arc<Self>) -> InstallReport {
        InstallReport {
            updated_urls: self
                .updated
                .lock()
                .expect("install report lock poisoned")
                .clone(),
            not_updated_urls: self
                .not_updated
                .lock()
                .expect("install report lock poisoned")
                .clone(),
        }
    }
}

impl StrategyPlugin for InstallReportPlugin {
    fn cached_response_will_be_used(
        &self,
        phase: EventPhase,
        original: &Request,
        cached: Option<Response>,
    ) -> Option<Response> {
        if phase == EventPhase::Install {
            let url = original.url.to_string();
            if cached.is_some() {
                self.not_updated
                    .lock()
                    .expect("install report lock poisoned")
                    .push(url);
            } else {
                self.updated
                    .lock()
                    .expect("install report lock poisoned")
                    .push(url);
            }
        }
        cached
    }
}

// ==================== Lifecycle Manager ====================

/// Drives the precache through the worker lifecycle and exposes it as
/// routable handlers.
pub struct PrecacheLifecycle {
    registry: Arc<PrecacheRegistry>,
    strategy: Arc<PrecacheStrategy>,
}

impl PrecacheLifecycle {
    pub fn new(registry: Arc<PrecacheRegistry>, strategy: Arc<PrecacheStrategy>) -> Self {
        Self { registry, strategy }
    }

    pub fn registry(&self) -> &Arc<PrecacheRegistry> {
        &self.registry
    }

    pub fn strategy(&self) -> &Arc<PrecacheStrategy> {
        &self.strategy
    }

    /// Populate the versioned cache from the registry.
    ///
    /// Every entry is driven through the strategy's install path with the
    /// registry's integrity and cache mode; the first failure aborts the
    /// transition (entries already written stay written).
    pub async fn install(
        &self,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn NetworkFetcher>,
    ) -> Result<InstallReport, PrecacheError> {
        let event = Arc::new(FetchEvent::lifecycle(EventPhase::Install));
        let cx = StrategyContext::new(caches, fetcher, Arc::clone(&event));

        let report_plugin = Arc::new(InstallReportPlugin::default());
        let extras: [Arc<dyn StrategyPlugin>; 1] = [Arc::clone(&report_plugin) as Arc<dyn StrategyPlugin>];

        for (url, cache_key) in self.registry.entries() {
            let parsed = Url::parse(url).map_err(|e| PrecacheError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

            let mut request = Request::get(parsed)
                .cache_mode(self.registry.cache_mode_for_url(url))
                .credentials(CredentialsMode::SameOrigin);
            if let Some(integrity) = self.registry.get_integrity_for_cache_key(cache_key.href()) {
                request = request.integrity(integrity);
            }

            let params = MatchParams::for_cache_key(cache_key.href(), None);
            self.strategy
                .handle_with_plugins(&cx, request, Some(&params), &extras)
                .await?;
        }
        event.done_waiting().await;

        let report = report_plugin.into_report();
        info!(
            updated = report.updated_urls.len(),
            already_cached = report.not_updated_urls.len(),
            "Precache install complete"
        );
        Ok(report)
    }

    /// Delete every cached entry whose key the registry no longer
    /// expects. This is how a prior deployment's assets are purged.
    pub async fn activate(&self, caches: Arc<RwLock<CacheStorage>>) -> ActivateReport {
        let expected = self.registry.expected_cache_keys();
        let mut storage = caches.write().await;
        let cache = storage.open(self.strategy.cache_name());

        let mut deleted_urls = Vec::new();
        for key in cache.keys() {
            if !expected.contains(&key) {
                cache.delete(&key);
                deleted_urls.push(key);
            }
        }
        if deleted_urls.is_empty() {
            debug!("Precache cleanup found nothing stale");
        } else {
            info!(deleted = deleted_urls.len(), "Precache cleanup deleted stale entries");
        }
        ActivateReport { deleted_urls }
    }

    /// The precache as a route: a URL-variation matcher over the registry
    /// in front of the strategy. Register this before anything else so
    /// static assets never fall through to other routes.
    pub fn as_route(
        &self,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn NetworkFetcher>,
        variations: Arc<UrlVariationConfig>,
    ) -> Route {
        let registry = Arc::clone(&self.registry);
        let matcher = RouteMatcher::predicate(move |cx| {
            for variation in url_variations(cx.url, &variations) {
                if let Some(cache_key) = registry.get_cache_key_for_url(variation.as_str()) {
                    let integrity = registry
                        .get_integrity_for_cache_key(&cache_key)
                        .map(str::to_string);
                    return Some(MatchParams::for_cache_key(cache_key, integrity));
                }
            }
            trace!(url = %cx.url, "No precache entry for any URL variation");
            None
        });

        let strategy: Arc<dyn Strategy> = Arc::clone(&self.strategy) as Arc<dyn Strategy>;
        let handler = Arc::new(StrategyHandle::new(strategy, caches, fetcher));
        Route::new(matcher, handler)
    }

    /// Cached response for a registered URL, if present.
    pub async fn match_precache(
        &self,
        caches: &Arc<RwLock<CacheStorage>>,
        url: &str,
    ) -> Option<Response> {
        let cache_key = self.registry.get_cache_key_for_url(url)?;
        caches
            .read()
            .await
            .get(self.strategy.cache_name())
            .and_then(|cache| cache.match_url(&cache_key))
    }

    /// A handler that serves one registered URL's cached content no
    /// matter what was requested (the SPA-shell fallback).
    pub fn create_handler_bound_to_url(
        &self,
        url: &str,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn NetworkFetcher>,
    ) -> Result<BoundPrecacheHandler, PrecacheError> {
        let cache_key = self.registry.get_cache_key_for_url(url).ok_or_else(|| {
            PrecacheError::NonPrecachedUrl {
                url: url.to_string(),
            }
        })?;
        let bound_url =
            self.registry
                .base()
                .join(url)
                .map_err(|e| PrecacheError::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(BoundPrecacheHandler {
            url: bound_url,
            cache_key,
            strategy: Arc::clone(&self.strategy),
            caches,
            fetcher,
        })
    }
}

/// Serves a single precached URL regardless of the requested path.
pub struct BoundPrecacheHandler {
    url: Url,
    cache_key: String,
    strategy: Arc<PrecacheStrategy>,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn NetworkFetcher>,
}

impl std::fmt::Debug for BoundPrecacheHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundPrecacheHandler")
            .field("url", &self.url)
            .field("cache_key", &self.cache_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for BoundPrecacheHandler {
    async fn handle(&self, cx: HandlerContext) -> anyhow::Result<Response> {
        let strategy_cx = StrategyContext::new(
            Arc::clone(&self.caches),
            Arc::clone(&self.fetcher),
            Arc::clone(&cx.event),
        );
        let request = Request::get(self.url.clone());
        let params = MatchParams::for_cache_key(self.cache_key.clone(), None);
        Ok(self
            .strategy
            .handle(&strategy_cx, request, Some(&params))
            .await?)
    }
}
