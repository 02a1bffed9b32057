//! The precache registry: which URLs are expected in the cache, under
//! which keys, with which integrity metadata.
//!
//! Built once at worker startup and read-only afterwards. Conflicting
//! definitions fail construction loudly; a broken asset list must never
//! produce a half-consistent cache.

use hashbrown::{HashMap, HashSet};
use tracing::warn;
use url::Url;

use swkit_fetch::RequestCacheMode;

use crate::cache_key::{CacheKey, PrecacheEntry};
use crate::PrecacheError;

/// In-memory mapping from logical URL to canonical cache key.
#[derive(Debug)]
pub struct PrecacheRegistry {
    base: Url,
    urls_to_cache_keys: HashMap<String, CacheKey>,
    urls_to_cache_modes: HashMap<String, RequestCacheMode>,
    cache_keys_to_integrities: HashMap<String, String>,
}

impl PrecacheRegistry {
    /// Create an empty registry; relative entry URLs resolve against
    /// `base` (the worker scope).
    pub fn new(base: Url) -> Self {
        Self {
            base,
            urls_to_cache_keys: HashMap::new(),
            urls_to_cache_modes: HashMap::new(),
            cache_keys_to_integrities: HashMap::new(),
        }
    }

    /// Register precache entries.
    ///
    /// Registering the same `(url, cache key)` pair twice is a no-op.
    /// Re-registering a URL under a different cache key, or a cache key
    /// under different integrity metadata, fails the whole registration.
    ///
    /// Returns the URLs registered without revision info; those cannot be
    /// cache-busted and are worth surfacing to the build.
    pub fn add_entries<I, E>(&mut self, entries: I) -> Result<Vec<String>, PrecacheError>
    where
        I: IntoIterator<Item = E>,
        E: Into<PrecacheEntry>,
    {
        let mut unrevisioned = Vec::new();

        for entry in entries {
            let entry: PrecacheEntry = entry.into();
            let (cache_key, url) = CacheKey::for_entry(&entry, &self.base)?;
            let url = url.to_string();

            if entry.revision.is_none() {
                unrevisioned.push(url.clone());
            }
            let cache_mode = if entry.revision.is_some() {
                RequestCacheMode::Reload
            } else {
                RequestCacheMode::Default
            };

            if let Some(existing) = self.urls_to_cache_keys.get(&url) {
                if existing.href() != cache_key.href() {
                    return Err(PrecacheError::ConflictingEntry {
                        url,
                        first: existing.href().to_string(),
                        second: cache_key.href().to_string(),
                    });
                }
            }

            if let Some(integrity) = &entry.integrity {
                if let Some(existing) = self.cache_keys_to_integrities.get(cache_key.href()) {
                    if existing != integrity {
                        return Err(PrecacheError::ConflictingIntegrity { url });
                    }
                }
                self.cache_keys_to_integrities
                    .insert(cache_key.href().to_string(), integrity.clone());
            }

            self.urls_to_cache_modes.insert(url.clone(), cache_mode);
            self.urls_to_cache_keys.insert(url, cache_key);
        }

        if !unrevisioned.is_empty() {
            warn!(
                urls = ?unrevisioned,
                "Precaching URLs without revision info; their entries cannot be cache-busted"
            );
        }
        Ok(unrevisioned)
    }

    /// Canonical cache key for a URL, if registered.
    ///
    /// Relative URLs resolve against the registry base.
    pub fn get_cache_key_for_url(&self, url: &str) -> Option<String> {
        let absolute = self.base.join(url).ok()?;
        self.urls_to_cache_keys
            .get(absolute.as_str())
            .map(|key| key.href().to_string())
    }

    /// Integrity metadata declared for a cache key.
    pub fn get_integrity_for_cache_key(&self, cache_key: &str) -> Option<&str> {
        self.cache_keys_to_integrities
            .get(cache_key)
            .map(String::as_str)
    }

    /// Cache mode to use when fetching a registered URL.
    pub fn cache_mode_for_url(&self, url: &str) -> RequestCacheMode {
        self.urls_to_cache_modes
            .get(url)
            .copied()
            .unwrap_or_default()
    }

    /// Every registered logical URL, i.e. the current expected cache state.
    pub fn cached_urls(&self) -> Vec<String> {
        self.urls_to_cache_keys.keys().cloned().collect()
    }

    /// `(url, cache key)` pairs, for install-time population.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &CacheKey)> {
        self.urls_to_cache_keys
            .iter()
            .map(|(url, key)| (url.as_str(), key))
    }

    /// The set of cache keys expected after activation; anything else in
    /// the managed cache is stale.
    pub fn expected_cache_keys(&self) -> HashSet<String> {
        self.urls_to_cache_keys
            .values()
            .map(|key| key.href().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.urls_to_cache_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls_to_cache_keys.is_empty()
    }

    pub fn base(&self) -> &Url {
        &self.base
    }
}
