//! # SWKit Cache
//!
//! In-memory model of the browser cache storage, as seen by a service
//! worker: named caches of URL-keyed responses.
//!
//! ## Features
//!
//! - **Cache**: `match`, `put`, `delete`, `keys` over one named store
//! - **CacheStorage**: `open`, `has`, `delete` over the set of caches
//! - **Cache naming**: `<prefix>-<purpose>-<scope>` versioned names
//! - **Quota**: optional byte budget with quota-relief callbacks
//!
//! The engine does not own this storage in a real worker; it owns the
//! policy for what enters and leaves it. Mutation is funneled through the
//! precache strategy's write path and the lifecycle manager, and each
//! `put`/`delete` is atomic under the storage lock the runtime wraps
//! around this type.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use swkit_fetch::Response;

// ==================== Errors ====================

/// Errors that can occur in cache storage.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Quota exceeded: {needed} bytes needed, {quota} byte budget")]
    QuotaExceeded { needed: usize, quota: usize },
}

// ==================== Cache Names ====================

/// Cache naming scheme: a fixed prefix, a logical purpose tag, and a
/// suffix derived from the worker's registration scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheNameConfig {
    /// Fixed prefix shared by every cache this engine manages.
    pub prefix: String,
    /// Scope-derived suffix, distinguishing registrations on one origin.
    pub suffix: String,
}

impl Default for CacheNameConfig {
    fn default() -> Self {
        Self {
            prefix: "swkit".to_string(),
            suffix: String::new(),
        }
    }
}

impl CacheNameConfig {
    /// Naming config for a worker registered at `scope`.
    pub fn for_scope(scope: &str) -> Self {
        Self {
            prefix: "swkit".to_string(),
            suffix: scope.to_string(),
        }
    }

    fn join(&self, purpose: &str) -> String {
        [self.prefix.as_str(), purpose, self.suffix.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Name of the versioned precache.
    pub fn precache_name(&self) -> String {
        self.join("precache-v2")
    }

    /// Name of the runtime cache.
    pub fn runtime_name(&self) -> String {
        self.join("runtime")
    }
}

// ==================== Cache ====================

/// One named cache of URL-keyed responses.
#[derive(Debug, Default)]
pub struct Cache {
    name: String,
    entries: HashMap<String, Response>,
    bytes: usize,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
            bytes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up the stored response for a key URL.
    pub fn match_url(&self, url: &str) -> Option<Response> {
        self.entries.get(url).cloned()
    }

    /// Store a response under a key URL, replacing any previous entry.
    pub fn put(&mut self, url: &str, response: Response) {
        let size = response.body.len();
        if let Some(old) = self.entries.insert(url.to_string(), response) {
            self.bytes -= old.body.len();
        }
        self.bytes += size;
        trace!(cache = %self.name, url, size, "Cache entry written");
    }

    /// Delete the entry for a key URL.
    pub fn delete(&mut self, url: &str) -> bool {
        match self.entries.remove(url) {
            Some(old) => {
                self.bytes -= old.body.len();
                trace!(cache = %self.name, url, "Cache entry deleted");
                true
            }
            None => false,
        }
    }

    /// All key URLs currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total body bytes stored in this cache.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

// ==================== Cache Storage ====================

/// Callback invoked when a write exceeds the quota, given a chance to
/// evict least-needed entries before the error propagates.
pub type QuotaErrorCallback = Box<dyn Fn(&mut CacheStorage) + Send + Sync>;

/// The set of named caches available to one worker.
#[derive(Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    quota: Option<usize>,
    quota_callbacks: Vec<QuotaErrorCallback>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage with a total byte budget across all caches.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Open a cache, creating it if absent.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Look up a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a whole cache.
    pub fn delete(&mut self, name: &str) -> bool {
        let deleted = self.caches.remove(name).is_some();
        if deleted {
            debug!(cache = name, "Cache deleted");
        }
        deleted
    }

    /// Names of all caches.
    pub fn keys(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }

    /// Total body bytes across all caches.
    pub fn used_bytes(&self) -> usize {
        self.caches.values().map(Cache::bytes).sum()
    }

    /// Look up `url` across every cache.
    pub fn match_url(&self, url: &str) -> Option<Response> {
        self.caches.values().find_map(|cache| cache.match_url(url))
    }

    /// Store a response in the named cache, enforcing the byte budget.
    pub fn put(
        &mut self,
        cache_name: &str,
        url: &str,
        response: Response,
    ) -> Result<(), CacheError> {
        if let Some(quota) = self.quota {
            let replaced = self
                .caches
                .get(cache_name)
                .and_then(|cache| cache.entries.get(url))
                .map(|old| old.body.len())
                .unwrap_or(0);
            let needed = self.used_bytes() - replaced + response.body.len();
            if needed > quota {
                return Err(CacheError::QuotaExceeded { needed, quota });
            }
        }
        self.open(cache_name).put(url, response);
        Ok(())
    }

    /// Register a quota-relief callback.
    pub fn register_quota_error_callback(&mut self, callback: QuotaErrorCallback) {
        self.quota_callbacks.push(callback);
    }

    /// Run every registered quota-relief callback once.
    pub fn run_quota_error_callbacks(&mut self) {
        let callbacks = std::mem::take(&mut self.quota_callbacks);
        debug!(count = callbacks.len(), "Running quota-relief callbacks");
        for callback in &callbacks {
            callback(self);
        }
        self.quota_callbacks = callbacks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn response(body: &str) -> Response {
        Response::new(StatusCode::OK, body.as_bytes().to_vec())
    }

    #[test]
    fn test_cache_put_match_delete() {
        let mut cache = Cache::new("v1");
        cache.put("https://example.com/style.css", response("body{}"));

        assert!(cache.match_url("https://example.com/style.css").is_some());
        assert!(cache.match_url("https://example.com/other.css").is_none());
        assert_eq!(cache.bytes(), 6);

        assert!(cache.delete("https://example.com/style.css"));
        assert!(!cache.delete("https://example.com/style.css"));
        assert!(cache.is_empty());
        assert_eq!(cache.bytes(), 0);
    }

    #[test]
    fn test_cache_put_replaces_entry() {
        let mut cache = Cache::new("v1");
        cache.put("https://example.com/a.js", response("aaaa"));
        cache.put("https://example.com/a.js", response("bb"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes(), 2);
    }

    #[test]
    fn test_storage_open_has_delete() {
        let mut storage = CacheStorage::new();
        assert!(!storage.has("v1"));

        storage.open("v1");
        assert!(storage.has("v1"));

        assert!(storage.delete("v1"));
        assert!(!storage.has("v1"));
    }

    #[test]
    fn test_storage_quota_enforced() {
        let mut storage = CacheStorage::with_quota(8);
        storage
            .put("precache", "https://example.com/a", response("aaaa"))
            .unwrap();

        let err = storage
            .put("precache", "https://example.com/b", response("bbbbbbbb"))
            .unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { .. }));

        // Replacing an entry only charges the delta.
        storage
            .put("precache", "https://example.com/a", response("aaaaaaaa"))
            .unwrap();
    }

    #[test]
    fn test_quota_callbacks_can_make_room() {
        let mut storage = CacheStorage::with_quota(4);
        storage
            .put("runtime", "https://example.com/old", response("aaaa"))
            .unwrap();

        assert!(storage
            .put("runtime", "https://example.com/new", response("bbbb"))
            .is_err());

        storage.register_quota_error_callback(Box::new(|storage| {
            storage.delete("runtime");
        }));
        storage.run_quota_error_callbacks();

        storage
            .put("runtime", "https://example.com/new", response("bbbb"))
            .unwrap();
    }

    #[test]
    fn test_cache_names() {
        let names = CacheNameConfig::for_scope("https://example.com/app/");
        assert_eq!(
            names.precache_name(),
            "swkit-precache-v2-https://example.com/app/"
        );
        assert_eq!(names.runtime_name(), "swkit-runtime-https://example.com/app/");

        let bare = CacheNameConfig {
            prefix: "swkit".into(),
            suffix: String::new(),
        };
        assert_eq!(bare.precache_name(), "swkit-precache-v2");
    }
}
