//! # SWKit Routing
//!
//! Maps intercepted requests to handlers.
//!
//! ## Features
//!
//! - **Matchers**: exact URL, regular expression, arbitrary predicate
//! - **Ordering**: routes tried in registration order, per HTTP method
//! - **Fallbacks**: per-method default handlers
//! - **Error recovery**: route-level and global catch handlers
//!
//! ## Architecture
//!
//! ```text
//! Router
//!     ├── routes (per method, in registration order)
//!     │       └── Route { matcher, handler, catch_handler? }
//!     ├── default handlers (per method)
//!     └── global catch handler
//! ```
//!
//! Regular-expression routes only handle a cross-origin URL when the match
//! consumes the href from its very start; a pattern that merely matches a
//! path fragment must not capture other origins' traffic.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use hashbrown::HashMap;
use http::Method;
use regex::Regex;
use tracing::{debug, trace, warn};
use url::Url;

use swkit_fetch::{FetchEvent, NetworkFetcher, Request, Response};

// ==================== Match Results ====================

/// Parameters produced by a successful route match and handed to the
/// route's handler.
#[derive(Debug, Clone, Default)]
pub struct MatchParams {
    /// Positional captures from a pattern route.
    pub captures: Vec<String>,
    /// Canonical cache key, when the matcher resolved one.
    pub cache_key: Option<String>,
    /// Integrity metadata attached to the cache key.
    pub integrity: Option<String>,
}

impl MatchParams {
    /// Params for a resolved cache key.
    pub fn for_cache_key(cache_key: impl Into<String>, integrity: Option<String>) -> Self {
        Self {
            captures: Vec::new(),
            cache_key: Some(cache_key.into()),
            integrity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.cache_key.is_none() && self.integrity.is_none()
    }
}

/// Per-request context handed to matchers.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub url: &'a Url,
    pub request: &'a Request,
    pub same_origin: bool,
}

// ==================== Handlers ====================

/// Context handed to a matched handler.
pub struct HandlerContext {
    pub url: Url,
    pub request: Request,
    pub event: Arc<FetchEvent>,
    pub params: Option<MatchParams>,
}

/// A response-producing handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, cx: HandlerContext) -> anyhow::Result<Response>;
}

type HandlerFn =
    dyn Fn(HandlerContext) -> BoxFuture<'static, anyhow::Result<Response>> + Send + Sync;

/// Wraps a bare async function into a [`Handler`].
pub struct FnHandler {
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        Self {
            f: Box::new(move |cx| f(cx).boxed()),
        }
    }
}

#[async_trait]
impl Handler for FnHandler {
    async fn handle(&self, cx: HandlerContext) -> anyhow::Result<Response> {
        (self.f)(cx).await
    }
}

/// Convenience: wrap a bare async function and hand back a shared handler.
pub fn fn_handler<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

/// Transparent network passthrough.
pub struct NetworkOnly {
    fetcher: Arc<dyn NetworkFetcher>,
}

impl NetworkOnly {
    pub fn new(fetcher: Arc<dyn NetworkFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Handler for NetworkOnly {
    async fn handle(&self, cx: HandlerContext) -> anyhow::Result<Response> {
        Ok(self.fetcher.fetch(&cx.request).await?)
    }
}

// ==================== Routes ====================

type MatchFn = dyn Fn(&RequestContext<'_>) -> Option<MatchParams> + Send + Sync;

/// How a route decides whether it applies to a request.
pub enum RouteMatcher {
    /// Exact href comparison.
    Exact(Url),
    /// Regular expression over the full href.
    Pattern(Regex),
    /// Arbitrary predicate.
    Predicate(Arc<MatchFn>),
}

impl RouteMatcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&RequestContext<'_>) -> Option<MatchParams> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    fn matches(&self, cx: &RequestContext<'_>) -> Option<MatchParams> {
        match self {
            RouteMatcher::Exact(target) => {
                (cx.url.as_str() == target.as_str()).then(MatchParams::default)
            }
            RouteMatcher::Pattern(regex) => {
                let captures = regex.captures(cx.url.as_str())?;
                let start = captures.get(0).map(|m| m.start()).unwrap_or(0);
                if !cx.same_origin && start != 0 {
                    debug!(
                        pattern = %regex.as_str(),
                        url = %cx.url,
                        "Pattern only partially matched a cross-origin URL, skipping"
                    );
                    return None;
                }
                let params = captures
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|m| m.as_str().to_string())
                    .collect();
                Some(MatchParams {
                    captures: params,
                    ..MatchParams::default()
                })
            }
            RouteMatcher::Predicate(f) => f(cx),
        }
    }
}

impl std::fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteMatcher::Exact(url) => f.debug_tuple("Exact").field(url).finish(),
            RouteMatcher::Pattern(regex) => f.debug_tuple("Pattern").field(regex).finish(),
            RouteMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A registered route.
pub struct Route {
    pub matcher: RouteMatcher,
    pub handler: Arc<dyn Handler>,
    pub method: Method,
    pub catch_handler: Option<Arc<dyn Handler>>,
}

impl Route {
    pub fn new(matcher: RouteMatcher, handler: Arc<dyn Handler>) -> Self {
        Self {
            matcher,
            handler,
            method: Method::GET,
            catch_handler: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn catch_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.catch_handler = Some(handler);
        self
    }
}

// ==================== Router ====================

/// Method-scoped, ordered route table.
pub struct Router {
    origin: Url,
    routes: HashMap<Method, Vec<Route>>,
    default_handlers: HashMap<Method, Arc<dyn Handler>>,
    catch_handler: Option<Arc<dyn Handler>>,
}

impl Router {
    /// Create a router for a worker whose scope lives on `origin`.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: HashMap::new(),
            default_handlers: HashMap::new(),
            catch_handler: None,
        }
    }

    /// Register a route. Routes are tried in registration order.
    pub fn register_route(&mut self, route: Route) {
        self.routes
            .entry(route.method.clone())
            .or_default()
            .push(route);
    }

    /// Handler used when no route matches a request of `method`.
    pub fn set_default_handler(&mut self, handler: Arc<dyn Handler>, method: Method) {
        self.default_handlers.insert(method, handler);
    }

    /// Handler of last resort for errors no route-level catch absorbed.
    pub fn set_catch_handler(&mut self, handler: Arc<dyn Handler>) {
        self.catch_handler = Some(handler);
    }

    /// Number of registered routes, across all methods.
    pub fn route_count(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    fn find_matching_route(
        &self,
        cx: &RequestContext<'_>,
        method: &Method,
    ) -> Option<(&Route, Option<MatchParams>)> {
        for route in self.routes.get(method)? {
            if let Some(params) = route.matcher.matches(cx) {
                let params = (!params.is_empty()).then_some(params);
                return Some((route, params));
            }
        }
        None
    }

    /// Route a request.
    ///
    /// Returns `None` when the request is not handled at all: non-HTTP(S)
    /// schemes, or no matching route and no default handler for its
    /// method. The caller owns the network fallback in that case.
    pub async fn handle_request(
        &self,
        request: &Request,
        event: &Arc<FetchEvent>,
    ) -> Option<anyhow::Result<Response>> {
        let url = &request.url;
        if !matches!(url.scheme(), "http" | "https") {
            trace!(url = %url, "Ignoring non-HTTP(S) request");
            return None;
        }

        let same_origin = url.origin() == self.origin.origin();
        let cx = RequestContext {
            url,
            request,
            same_origin,
        };

        let (handler, catch_handler, params) = match self.find_matching_route(&cx, &request.method)
        {
            Some((route, params)) => {
                trace!(url = %url, matcher = ?route.matcher, "Route matched");
                (
                    Arc::clone(&route.handler),
                    route.catch_handler.clone(),
                    params,
                )
            }
            None => match self.default_handlers.get(&request.method) {
                Some(handler) => {
                    trace!(url = %url, method = %request.method, "Falling back to default handler");
                    (Arc::clone(handler), None, None)
                }
                None => {
                    debug!(url = %url, "No route found");
                    return None;
                }
            },
        };

        let handler_cx = HandlerContext {
            url: url.clone(),
            request: request.clone(),
            event: Arc::clone(event),
            params,
        };
        let mut result = handler.handle(handler_cx).await;

        if let Err(err) = &result {
            if let Some(catch) = catch_handler {
                warn!(url = %url, error = %err, "Route handler failed, trying route catch handler");
                match catch
                    .handle(HandlerContext {
                        url: url.clone(),
                        request: request.clone(),
                        event: Arc::clone(event),
                        params: None,
                    })
                    .await
                {
                    Ok(response) => return Some(Ok(response)),
                    Err(catch_err) => result = Err(catch_err),
                }
            }
        }

        if let Err(err) = &result {
            if let Some(catch) = &self.catch_handler {
                warn!(url = %url, error = %err, "Falling back to global catch handler");
                return Some(
                    catch
                        .handle(HandlerContext {
                            url: url.clone(),
                            request: request.clone(),
                            event: Arc::clone(event),
                            params: None,
                        })
                        .await,
                );
            }
        }

        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use swkit_fetch::StubFetcher;

    fn origin() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    fn tagged(tag: &'static str) -> Arc<dyn Handler> {
        fn_handler(move |_cx| async move { Ok(Response::ok_with(tag)) })
    }

    fn failing(message: &'static str) -> Arc<dyn Handler> {
        fn_handler(move |_cx| async move { Err(anyhow::anyhow!(message)) })
    }

    async fn route(router: &Router, url: &str) -> Option<anyhow::Result<Response>> {
        let request = Request::get(Url::parse(url).unwrap());
        let event = Arc::new(FetchEvent::fetch(request.clone()));
        router.handle_request(&request, &event).await
    }

    #[tokio::test]
    async fn test_registration_order_wins() {
        let mut router = Router::new(origin());
        router.register_route(Route::new(
            RouteMatcher::Pattern(Regex::new(r"\.css$").unwrap()),
            tagged("first"),
        ));
        router.register_route(Route::new(
            RouteMatcher::Pattern(Regex::new(r"\.css$").unwrap()),
            tagged("second"),
        ));

        let response = route(&router, "https://example.com/a.css")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.text(), "first");
    }

    #[tokio::test]
    async fn test_method_scoping() {
        let mut router = Router::new(origin());
        router.register_route(
            Route::new(
                RouteMatcher::Exact(Url::parse("https://example.com/api").unwrap()),
                tagged("post"),
            )
            .method(Method::POST),
        );

        assert!(route(&router, "https://example.com/api").await.is_none());
    }

    #[tokio::test]
    async fn test_default_handler_fallback() {
        let mut router = Router::new(origin());
        router.set_default_handler(tagged("default"), Method::GET);

        let response = route(&router, "https://example.com/anything")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.text(), "default");
    }

    #[tokio::test]
    async fn test_catch_handler_chain() {
        let mut router = Router::new(origin());
        router.register_route(
            Route::new(
                RouteMatcher::Pattern(Regex::new(r"/route-catch").unwrap()),
                failing("boom"),
            )
            .catch_handler(tagged("route-catch")),
        );
        router.register_route(Route::new(
            RouteMatcher::Pattern(Regex::new(r"/global-catch").unwrap()),
            failing("boom"),
        ));
        router.set_catch_handler(tagged("global-catch"));

        let response = route(&router, "https://example.com/route-catch")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.text(), "route-catch");

        let response = route(&router, "https://example.com/global-catch")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.text(), "global-catch");
    }

    #[tokio::test]
    async fn test_unhandled_error_propagates() {
        let mut router = Router::new(origin());
        router.register_route(Route::new(
            RouteMatcher::Pattern(Regex::new(r"/fails").unwrap()),
            failing("boom"),
        ));

        let result = route(&router, "https://example.com/fails").await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cross_origin_partial_match_rejected() {
        let mut router = Router::new(origin());
        router.register_route(Route::new(
            RouteMatcher::Pattern(Regex::new(r"/styles/.*\.css$").unwrap()),
            tagged("styles"),
        ));

        // Same-origin: a path-fragment match is fine.
        assert!(route(&router, "https://example.com/styles/a.css")
            .await
            .is_some());

        // Cross-origin: the fragment match must not capture the request.
        assert!(route(&router, "https://cross-origin.com/styles/a.css")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_cross_origin_full_match_accepted() {
        let mut router = Router::new(origin());
        router.register_route(Route::new(
            RouteMatcher::Pattern(Regex::new(r"^https://fonts\.example\.net/.*").unwrap()),
            tagged("fonts"),
        ));

        assert!(route(&router, "https://fonts.example.net/inter.woff2")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_non_http_scheme_unhandled() {
        let mut router = Router::new(origin());
        router.set_default_handler(tagged("default"), Method::GET);

        assert!(route(&router, "chrome-extension://abcdef/page.html")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_pattern_captures_become_params() {
        let mut router = Router::new(origin());
        router.register_route(Route::new(
            RouteMatcher::Pattern(Regex::new(r"/user/(\w+)$").unwrap()),
            fn_handler(|cx| async move {
                let name = cx
                    .params
                    .and_then(|p| p.captures.into_iter().next())
                    .unwrap_or_default();
                Ok(Response::ok_with(name))
            }),
        ));

        let response = route(&router, "https://example.com/user/ada")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.text(), "ada");
    }

    #[tokio::test]
    async fn test_network_only_passthrough() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.stub("https://example.com/live", Response::ok_with("live"));

        let mut router = Router::new(origin());
        router.set_default_handler(Arc::new(NetworkOnly::new(fetcher.clone())), Method::GET);

        let response = route(&router, "https://example.com/live")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(fetcher.call_count(), 1);
    }
}
