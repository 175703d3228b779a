//! Bounded local disk cache.

use super::lru::LruIndex;
use super::{CacheEntry, CacheStore, EntryInfo, FetchMode};
use crate::backends::filesystem::FilesystemBackend;
use crate::error::{StorageError, StorageResult};
use crate::traits::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use prism_core::CacheKey;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::instrument;

/// Cache directory with a total byte budget and LRU eviction.
pub struct LocalDiskCache {
    files: FilesystemBackend,
    index: LruIndex,
    max_bytes: u64,
    /// Serializes evict-then-write so concurrent stores cannot overshoot.
    write_lock: Mutex<()>,
}

impl LocalDiskCache {
    /// Open (or create) a cache directory and index what is already there.
    pub async fn open(path: impl AsRef<Path>, max_bytes: u64) -> StorageResult<Self> {
        let files = FilesystemBackend::new(path).await?;

        let mut existing = Vec::new();
        for key in files.list("").await? {
            match files.head(&key).await {
                Ok(meta) => existing.push((key, meta)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        existing.sort_by_key(|(_, meta)| meta.last_modified);

        let index = LruIndex::new();
        for (key, meta) in &existing {
            index.record(key, meta.size);
        }

        tracing::info!(
            path = %files.root().display(),
            entries = index.len(),
            total_bytes = index.total_size(),
            max_bytes,
            "Local cache indexed"
        );

        let cache = Self {
            files,
            index,
            max_bytes,
            write_lock: Mutex::new(()),
        };
        // A shrunk budget applies immediately.
        {
            let _guard = cache.write_lock.lock().await;
            cache.evict_until_fits(0).await?;
        }
        Ok(cache)
    }

    /// Bytes currently held.
    pub fn total_bytes(&self) -> u64 {
        self.index.total_size()
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Evict least recently used entries until `incoming` more bytes fit.
    async fn evict_until_fits(&self, incoming: u64) -> StorageResult<()> {
        while self.index.total_size() + incoming > self.max_bytes {
            let Some(victim) = self.index.oldest() else {
                break;
            };
            match self.files.delete(&victim).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            let freed = self.index.remove(&victim).unwrap_or(0);
            tracing::debug!(key = %victim, freed, "Evicted cache entry");
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for LocalDiskCache {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn probe(&self, key: &CacheKey) -> StorageResult<bool> {
        let name = key.to_string();
        if !self.index.contains(&name) {
            return Ok(false);
        }
        if self.files.exists(&name).await? {
            return Ok(true);
        }
        // Removed behind our back.
        self.index.remove(&name);
        Ok(false)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn fetch(&self, key: &CacheKey, _mode: FetchMode) -> StorageResult<CacheEntry> {
        let name = key.to_string();
        match self.files.get(&name).await {
            Ok(data) => {
                self.index.touch(&name);
                Ok(CacheEntry::Bytes {
                    data,
                    content_type: None,
                })
            }
            Err(e) => {
                if e.is_not_found() {
                    self.index.remove(&name);
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, data, _info), fields(backend = "local", size = data.len()))]
    async fn store(&self, key: &CacheKey, data: Bytes, _info: EntryInfo<'_>) -> StorageResult<()> {
        let size = data.len() as u64;
        if size > self.max_bytes {
            tracing::debug!(
                key = %key,
                size,
                max_bytes = self.max_bytes,
                "Entry exceeds cache budget, not stored"
            );
            return Ok(());
        }

        let name = key.to_string();
        let _guard = self.write_lock.lock().await;
        // A replaced entry frees its old size first.
        self.index.remove(&name);
        self.evict_until_fits(size).await?;
        self.files.put(&name, data).await?;
        self.index.record(&name, size);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.files.health_check().await
    }
}
