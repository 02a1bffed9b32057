//! Cache-key derivation and URL variation generation.
//!
//! The URL identifies a resource on the network; the cache key identifies
//! its stored entry. The two differ exactly when an entry carries a
//! revision, which is embedded as a reserved query parameter so that a
//! content change forces a re-fetch without changing the public URL.

use std::sync::Arc;

use regex::Regex;
use url::Url;

use crate::PrecacheError;

/// Reserved query parameter carrying an entry's revision in its cache key.
pub const REVISION_PARAM: &str = "__WB_REVISION__";

// ==================== Entries ====================

/// One versioned static asset, as listed by the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheEntry {
    /// Logical URL, absolute or relative to the worker scope.
    pub url: String,
    /// Opaque version marker; absent for content-addressed URLs.
    pub revision: Option<String>,
    /// Subresource integrity hash.
    pub integrity: Option<String>,
}

impl PrecacheEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            revision: None,
            integrity: None,
        }
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }
}

impl From<&str> for PrecacheEntry {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for PrecacheEntry {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

// ==================== Cache Keys ====================

/// A cache key: the entry's URL plus its optional revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    url: Url,
    revision: Option<String>,
    href: String,
}

impl CacheKey {
    /// Derive the `(cache key, normalized URL)` pair for an entry.
    ///
    /// Relative entry URLs resolve against `base` (the worker scope).
    /// Unrevisioned entries key by their bare URL; revisioned entries get
    /// the revision appended under [`REVISION_PARAM`].
    pub fn for_entry(entry: &PrecacheEntry, base: &Url) -> Result<(Self, Url), PrecacheError> {
        let url = base
            .join(&entry.url)
            .map_err(|e| PrecacheError::InvalidUrl {
                url: entry.url.clone(),
                reason: e.to_string(),
            })?;

        let mut key_url = url.clone();
        if let Some(revision) = &entry.revision {
            let pairs: Vec<(String, String)> = key_url
                .query_pairs()
                .filter(|(name, _)| name != REVISION_PARAM)
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();
            let mut editor = key_url.query_pairs_mut();
            editor.clear();
            for (name, value) in &pairs {
                editor.append_pair(name, value);
            }
            editor.append_pair(REVISION_PARAM, revision);
            drop(editor);
        }

        let href = key_url.to_string();
        Ok((
            Self {
                url: key_url,
                revision: entry.revision.clone(),
                href,
            },
            url,
        ))
    }

    /// The key's wire form, usable as a storage key.
    pub fn href(&self) -> &str {
        &self.href
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }
}

// ==================== URL Variations ====================

/// Extra variation hook: given the fragment-stripped URL, produce
/// additional URLs to try against the registry.
pub type UrlManipulation = Arc<dyn Fn(&Url) -> Vec<Url> + Send + Sync>;

/// Configuration for URL variation generation.
#[derive(Clone)]
pub struct UrlVariationConfig {
    /// Query parameters matching any of these patterns are ignored when
    /// matching a request against the registry.
    pub ignore_url_params: Vec<Regex>,
    /// Index filename appended to directory URLs.
    pub directory_index: Option<String>,
    /// Also try the path with `.html` appended.
    pub clean_urls: bool,
    /// Caller-supplied extra variations, tried last.
    pub url_manipulation: Option<UrlManipulation>,
}

impl Default for UrlVariationConfig {
    fn default() -> Self {
        Self {
            ignore_url_params: vec![
                Regex::new("^utm_").expect("hard-coded pattern is valid"),
                Regex::new("^fbclid$").expect("hard-coded pattern is valid"),
            ],
            directory_index: Some("index.html".to_string()),
            clean_urls: true,
            url_manipulation: None,
        }
    }
}

impl std::fmt::Debug for UrlVariationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlVariationConfig")
            .field("ignore_url_params", &self.ignore_url_params)
            .field("directory_index", &self.directory_index)
            .field("clean_urls", &self.clean_urls)
            .field("url_manipulation", &self.url_manipulation.is_some())
            .finish()
    }
}

fn remove_ignored_params(url: &Url, patterns: &[Regex]) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !patterns.iter().any(|pattern| pattern.is_match(name)))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        let mut editor = stripped.query_pairs_mut();
        editor.clear();
        for (name, value) in &kept {
            editor.append_pair(name, value);
        }
    }
    stripped
}

enum Stage {
    Original,
    Stripped,
    DirectoryIndex,
    CleanUrl,
    Extra,
    Done,
}

/// Lazy, finite, restartable-by-reconstruction sequence of URL variations
/// to try, in fixed precedence order.
pub struct UrlVariations<'a> {
    config: &'a UrlVariationConfig,
    original: Url,
    stripped: Option<Url>,
    extra: Option<std::vec::IntoIter<Url>>,
    stage: Stage,
}

/// Generate the variation sequence for `url`.
///
/// Order: the fragment-stripped URL; the same with ignored query params
/// removed; the directory-index variation; the clean-URL variation; any
/// caller-supplied extras. The first variation found in the registry wins.
pub fn url_variations<'a>(url: &Url, config: &'a UrlVariationConfig) -> UrlVariations<'a> {
    let mut original = url.clone();
    original.set_fragment(None);
    UrlVariations {
        config,
        original,
        stripped: None,
        extra: None,
        stage: Stage::Original,
    }
}

impl Iterator for UrlVariations<'_> {
    type Item = Url;

    fn next(&mut self) -> Option<Url> {
        loop {
            match self.stage {
                Stage::Original => {
                    self.stage = Stage::Stripped;
                    return Some(self.original.clone());
                }
                Stage::Stripped => {
                    let stripped =
                        remove_ignored_params(&self.original, &self.config.ignore_url_params);
                    self.stripped = Some(stripped.clone());
                    self.stage = Stage::DirectoryIndex;
                    return Some(stripped);
                }
                Stage::DirectoryIndex => {
                    self.stage = Stage::CleanUrl;
                    let stripped = self.stripped.as_ref()?;
                    if let Some(index) = &self.config.directory_index {
                        if stripped.path().ends_with('/') {
                            let mut with_index = stripped.clone();
                            with_index.set_path(&format!("{}{}", stripped.path(), index));
                            return Some(with_index);
                        }
                    }
                }
                Stage::CleanUrl => {
                    self.stage = Stage::Extra;
                    let stripped = self.stripped.as_ref()?;
                    if self.config.clean_urls {
                        let mut clean = stripped.clone();
                        clean.set_path(&format!("{}.html", stripped.path()));
                        return Some(clean);
                    }
                }
                Stage::Extra => {
                    if self.extra.is_none() {
                        match &self.config.url_manipulation {
                            Some(manipulate) => {
                                self.extra = Some(manipulate(&self.original).into_iter());
                            }
                            None => {
                                self.stage = Stage::Done;
                                continue;
                            }
                        }
                    }
                    match self.extra.as_mut().and_then(Iterator::next) {
                        Some(url) => return Some(url),
                        None => self.stage = Stage::Done,
                    }
                }
                Stage::Done => return None,
            }
        }
    }
}
