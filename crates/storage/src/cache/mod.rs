//! Transform result caches.
//!
//! A cache holds finished transform outputs addressed by [`CacheKey`].
//! Two backends exist: a bounded directory on local disk and a prefix
//! inside the object store, optionally fronted by a CDN.

mod local;
mod lru;
mod remote;

pub use local::LocalDiskCache;
pub use lru::LruIndex;
pub use remote::RemoteObjectCache;

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use prism_core::CacheKey;
use prism_core::config::CacheConfig;
use std::sync::Arc;

/// How the caller intends to use a hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    /// Programmatic cross-origin fetch: bytes must be served inline.
    Inline,
    /// Direct browser navigation: a redirect is acceptable.
    Navigation,
}

/// What a cache lookup produced.
pub enum CacheEntry {
    Bytes {
        data: Bytes,
        content_type: Option<String>,
    },
    Stream {
        stream: ByteStream,
        length: u64,
        content_type: Option<String>,
    },
    Redirect(String),
    Miss,
}

impl CacheEntry {
    pub fn is_hit(&self) -> bool {
        !matches!(self, Self::Miss)
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes { data, .. } => write!(f, "Bytes({} bytes)", data.len()),
            Self::Stream { length, .. } => write!(f, "Stream({length} bytes)"),
            Self::Redirect(url) => write!(f, "Redirect({url})"),
            Self::Miss => f.write_str("Miss"),
        }
    }
}

/// What is being stored alongside an entry's bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryInfo<'a> {
    pub content_type: &'a str,
    /// Container the source belongs to. Remote entries are tagged `slug={container}`.
    pub container: &'a str,
}

impl<'a> EntryInfo<'a> {
    pub fn new(content_type: &'a str, container: &'a str) -> Self {
        Self {
            content_type,
            container,
        }
    }
}

/// Storage for finished transform outputs.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Whether an entry exists for `key`.
    async fn probe(&self, key: &CacheKey) -> StorageResult<bool>;

    /// Fetch an entry. Absent entries report `NotFound`.
    async fn fetch(&self, key: &CacheKey, mode: FetchMode) -> StorageResult<CacheEntry>;

    /// Store an entry, replacing any previous one.
    async fn store(&self, key: &CacheKey, data: Bytes, info: EntryInfo<'_>) -> StorageResult<()>;

    fn backend_name(&self) -> &'static str;

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Look up `key`, folding every failure into a miss.
///
/// Not-found is an ordinary miss and stays quiet; anything else is logged.
pub async fn lookup(cache: &dyn CacheStore, key: &CacheKey, mode: FetchMode) -> CacheEntry {
    let result = async {
        if !cache.probe(key).await? {
            return Ok(CacheEntry::Miss);
        }
        cache.fetch(key, mode).await
    }
    .await;

    match result {
        Ok(entry) => entry,
        Err(StorageError::NotFound(_)) => CacheEntry::Miss,
        Err(e) => {
            tracing::warn!(
                key = %key,
                backend = cache.backend_name(),
                error = %e,
                "Cache lookup failed, treating as miss"
            );
            CacheEntry::Miss
        }
    }
}

/// Store a result, logging instead of failing. Empty results are skipped.
pub async fn persist(
    cache: &dyn CacheStore,
    key: &CacheKey,
    data: Bytes,
    info: EntryInfo<'_>,
) -> bool {
    if data.is_empty() {
        tracing::debug!(key = %key, "Skipping empty transform result");
        return false;
    }

    match cache.store(key, data, info).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                key = %key,
                backend = cache.backend_name(),
                error = %e,
                "Failed to persist transform result"
            );
            false
        }
    }
}

/// Create a cache store from configuration.
///
/// The remote cache keeps its entries in `objects`.
pub async fn from_config(
    config: &CacheConfig,
    objects: Arc<dyn ObjectStore>,
) -> StorageResult<Arc<dyn CacheStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        CacheConfig::Local { path, max_bytes } => {
            Ok(Arc::new(LocalDiskCache::open(path, *max_bytes).await?))
        }
        CacheConfig::Remote { cdn_url, prefix } => Ok(Arc::new(RemoteObjectCache::new(
            objects,
            prefix.clone(),
            cdn_url.clone(),
        ))),
    }
}
