//! # SWKit SSR
//!
//! The server-side-render seam of the swkit service-worker engine: a
//! deserialized route manifest plus an opaque render backend.
//!
//! ## Features
//!
//! - **RouteManifest**: serialized route table → compiled match patterns
//! - **SsrApp**: `match_request` / `render` over the manifest
//! - **RenderBackend**: the opaque capability that turns a matched route
//!   into a response
//!
//! The manifest is fixed per worker instantiation: deserialized once at
//! startup and reused for every request until the worker is replaced.
//! Routes excluded at build time are simply absent from it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use swkit_fetch::{Request, Response};

// ==================== Errors ====================

/// Errors raised while loading a route manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

// ==================== Manifest ====================

/// Kind of server-rendered route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    /// Renders an HTML document.
    Page,
    /// Calls a data endpoint.
    Endpoint,
}

#[derive(Debug, Deserialize)]
struct SerializedRouteData {
    pattern: String,
    #[serde(default)]
    params: Vec<String>,
    component: String,
    #[serde(default)]
    pathname: Option<String>,
    #[serde(rename = "type")]
    route_type: RouteType,
}

#[derive(Debug, Deserialize)]
struct SerializedManifest {
    routes: Vec<SerializedRouteData>,
    #[serde(default)]
    assets: Vec<String>,
}

/// One server-rendered route with its compiled match pattern.
#[derive(Debug, Clone)]
pub struct RouteData {
    /// Compiled pattern matched against the URL path.
    pub pattern: Regex,
    /// Named parameters, in pattern order.
    pub params: Vec<String>,
    /// Opaque component reference, resolved by the render backend.
    pub component: String,
    /// Literal pathname, for routes without dynamic segments.
    pub pathname: Option<String>,
    pub route_type: RouteType,
}

/// The route table produced by the build.
#[derive(Debug, Clone, Default)]
pub struct RouteManifest {
    pub routes: Vec<RouteData>,
    pub assets: HashSet<String>,
}

impl RouteManifest {
    /// Deserialize a manifest, compiling every route pattern.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let serialized: SerializedManifest = serde_json::from_str(json)?;

        let mut routes = Vec::with_capacity(serialized.routes.len());
        for route in serialized.routes {
            let pattern =
                Regex::new(&route.pattern).map_err(|e| ManifestError::InvalidPattern {
                    pattern: route.pattern.clone(),
                    reason: e.to_string(),
                })?;
            routes.push(RouteData {
                pattern,
                params: route.params,
                component: route.component,
                pathname: route.pathname,
                route_type: route.route_type,
            });
        }

        debug!(
            routes = routes.len(),
            assets = serialized.assets.len(),
            "Route manifest loaded"
        );
        Ok(Self {
            routes,
            assets: serialized.assets.into_iter().collect(),
        })
    }

    /// First route whose pattern matches `pathname`.
    pub fn match_route(&self, pathname: &str) -> Option<&RouteData> {
        self.routes
            .iter()
            .find(|route| route.pattern.is_match(pathname))
    }
}

// ==================== Renderer ====================

/// The opaque capability that renders a matched route.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn render(&self, request: &Request, route: &RouteData) -> anyhow::Result<Response>;
}

/// A route manifest bound to its render backend.
pub struct SsrApp {
    manifest: RouteManifest,
    backend: Arc<dyn RenderBackend>,
}

impl SsrApp {
    pub fn new(manifest: RouteManifest, backend: Arc<dyn RenderBackend>) -> Self {
        Self { manifest, backend }
    }

    pub fn manifest(&self) -> &RouteManifest {
        &self.manifest
    }

    /// Match a request against the manifest by URL path.
    pub fn match_request(&self, request: &Request) -> Option<&RouteData> {
        let matched = self.manifest.match_route(request.url.path());
        trace!(
            url = %request.url,
            matched = matched.is_some(),
            "SSR manifest match"
        );
        matched
    }

    /// Render a request, matching first if no route was supplied.
    /// An unmatched request renders as a plain 404.
    pub async fn render(
        &self,
        request: &Request,
        route: Option<&RouteData>,
    ) -> anyhow::Result<Response> {
        let route = match route.or_else(|| self.match_request(request)) {
            Some(route) => route,
            None => return Ok(Response::new(StatusCode::NOT_FOUND, "Not found")),
        };
        self.backend.render(request, route).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    const MANIFEST: &str = r#"{
        "routes": [
            {
                "pattern": "^\\/$",
                "params": [],
                "component": "src/pages/index.js",
                "pathname": "/",
                "type": "page"
            },
            {
                "pattern": "^\\/posts\\/([^/]+?)\\/?$",
                "params": ["slug"],
                "component": "src/pages/posts/[slug].js",
                "type": "page"
            },
            {
                "pattern": "^\\/api\\/search$",
                "params": [],
                "component": "src/pages/api/search.js",
                "pathname": "/api/search",
                "type": "endpoint"
            }
        ],
        "assets": ["/favicon.ico"]
    }"#;

    struct EchoBackend;

    #[async_trait]
    impl RenderBackend for EchoBackend {
        async fn render(&self, _request: &Request, route: &RouteData) -> anyhow::Result<Response> {
            Ok(Response::ok_with(route.component.clone()))
        }
    }

    fn app() -> SsrApp {
        SsrApp::new(
            RouteManifest::from_json(MANIFEST).unwrap(),
            Arc::new(EchoBackend),
        )
    }

    fn request(url: &str) -> Request {
        Request::navigate(Url::parse(url).unwrap())
    }

    #[test]
    fn test_manifest_deserializes_and_compiles() {
        let manifest = RouteManifest::from_json(MANIFEST).unwrap();
        assert_eq!(manifest.routes.len(), 3);
        assert!(manifest.assets.contains("/favicon.ico"));
        assert_eq!(manifest.routes[0].route_type, RouteType::Page);
        assert_eq!(manifest.routes[2].route_type, RouteType::Endpoint);
        assert_eq!(manifest.routes[1].params, vec!["slug"]);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = RouteManifest::from_json(
            r#"{"routes": [{"pattern": "(", "component": "x", "type": "page"}], "assets": []}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidPattern { .. }));
    }

    #[test]
    fn test_match_route_in_order() {
        let manifest = RouteManifest::from_json(MANIFEST).unwrap();
        assert_eq!(
            manifest.match_route("/").unwrap().component,
            "src/pages/index.js"
        );
        assert_eq!(
            manifest.match_route("/posts/hello-world").unwrap().component,
            "src/pages/posts/[slug].js"
        );
        assert!(manifest.match_route("/missing").is_none());
    }

    #[tokio::test]
    async fn test_render_delegates_to_backend() {
        let response = app()
            .render(&request("https://example.com/api/search"), None)
            .await
            .unwrap();
        assert_eq!(response.text(), "src/pages/api/search.js");
    }

    #[tokio::test]
    async fn test_render_unmatched_is_404() {
        let response = app()
            .render(&request("https://example.com/nowhere"), None)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
