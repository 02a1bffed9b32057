//! # SWKit Precache
//!
//! Versioned precaching for the swkit service-worker engine: populate a
//! cache from a known asset list at install time, serve it afterwards,
//! and evict what the current deployment no longer ships.
//!
//! ## Features
//!
//! - **Cache keys**: revision-aware keys and URL variation generation
//! - **Registry**: url → cache key (+ integrity) mappings, conflict-checked
//! - **Strategy**: cache-then-network with install/steady-state phases
//! - **Lifecycle**: install population, activate eviction, bound handlers
//!
//! ## Architecture
//!
//! ```text
//! PrecacheRegistry (url → cacheKey, url → cacheMode, cacheKey → integrity)
//!     │
//!     ├── PrecacheStrategy ── StrategyPlugin chain ── CacheStorage
//!     │         │
//!     │         └── NetworkFetcher
//!     │
//!     └── PrecacheLifecycle
//!             ├── install  (populate, report updated vs resident)
//!             ├── activate (evict keys absent from the registry)
//!             └── as_route (URL-variation matcher + strategy handler)
//! ```

pub mod cache_key;
pub mod lifecycle;
pub mod registry;
pub mod strategy;

pub use cache_key::{
    url_variations, CacheKey, PrecacheEntry, UrlVariationConfig, UrlVariations, REVISION_PARAM,
};
pub use lifecycle::{ActivateReport, BoundPrecacheHandler, InstallReport, PrecacheLifecycle};
pub use registry::PrecacheRegistry;
pub use strategy::{
    CacheFirst, CacheKeyMode, CacheUpdateDecision, PrecacheStrategy, Strategy, StrategyContext,
    StrategyHandle, StrategyPlugin,
};

use thiserror::Error;

/// Errors raised while precaching.
#[derive(Error, Debug)]
pub enum PrecacheError {
    #[error("Conflicting precache entries for {url}: {first} already registered, got {second}")]
    ConflictingEntry {
        url: String,
        first: String,
        second: String,
    },

    #[error("Conflicting integrity metadata for {url}")]
    ConflictingIntegrity { url: String },

    #[error("{url} is not precached in {cache_name} and network fallback is disabled")]
    MissingPrecacheEntry { cache_name: String, url: String },

    #[error("Precaching {url} failed with status {status}")]
    BadPrecachingResponse { url: String, status: u16 },

    #[error("{url} is not in the precache registry")]
    NonPrecachedUrl { url: String },

    #[error("Refusing to cache a {method} request for {url}")]
    AttemptToCacheNonGetRequest { url: String, method: String },

    #[error("Cannot cache a network-error response for {url}")]
    CachePutWithNoResponse { url: String },

    #[error("No usable response produced for {url}")]
    NoResponse { url: String },

    #[error("Invalid precache URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(#[from] swkit_cache::CacheError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] swkit_fetch::FetchError),
}
