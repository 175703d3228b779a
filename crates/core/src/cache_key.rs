//! Cache key derivation.
//!
//! `canonical = "[" + locator + "](" + sorted_pairs_json + ")"` where the
//! pairs include the resolved output format under `f`. The key is the
//! xxHash64 of the canonical string, rendered as 16 lowercase hex digits
//! followed by the output extension.

use crate::format::OutputFormat;
use crate::settings::{SettingValue, Settings};
use crate::source::SourceLocator;
use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Seed for the cache key hash.
pub const CACHE_KEY_SEED: u64 = 0xabcd;

/// Identifies exactly one transform output.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    hash: u64,
    extension: String,
}

impl CacheKey {
    /// Derive the key for a source, its settings, and the resolved output format.
    pub fn derive(source: &SourceLocator, settings: &Settings, format: &OutputFormat) -> Self {
        let canonical = Self::canonical(source, settings, format);
        Self {
            hash: xxh64(canonical.as_bytes(), CACHE_KEY_SEED),
            extension: format.extension().to_string(),
        }
    }

    /// The canonical string that gets hashed.
    pub fn canonical(source: &SourceLocator, settings: &Settings, format: &OutputFormat) -> String {
        let mut pairs = settings.clone();
        pairs.set("f", SettingValue::Scalar(format.extension().to_string()));
        format!("[{source}]({})", pairs.to_sorted_pairs_json())
    }

    /// Hash as fixed-width lowercase hex.
    pub fn hash_hex(&self) -> String {
        format!("{:016x}", self.hash)
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Object key under a cache prefix, e.g. `_cache/0123abcd….webp`.
    pub fn object_key(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            self.to_string()
        } else {
            format!("{prefix}/{self}")
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{}", self.hash, self.extension)
    }
}
