//! Cache entries kept in the object store.

use super::{CacheEntry, CacheStore, EntryInfo, FetchMode};
use crate::error::StorageResult;
use crate::traits::{ObjectStore, PutOptions};
use async_trait::async_trait;
use bytes::Bytes;
use prism_core::{CACHED_OBJECT_MAX_AGE, CacheKey};
use std::sync::Arc;
use tracing::instrument;

/// Cache living under a prefix of an [`ObjectStore`].
///
/// With a CDN configured, browser navigations are redirected to the CDN copy
/// so the origin does not pay egress for ordinary page loads. Programmatic
/// fetches still get bytes inline since they are bound by CORS.
pub struct RemoteObjectCache {
    objects: Arc<dyn ObjectStore>,
    prefix: String,
    cdn_url: Option<String>,
}

impl RemoteObjectCache {
    pub fn new(objects: Arc<dyn ObjectStore>, prefix: String, cdn_url: Option<String>) -> Self {
        Self {
            objects,
            prefix: prefix.trim_matches('/').to_string(),
            cdn_url: cdn_url.map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    fn object_key(&self, key: &CacheKey) -> String {
        key.object_key(&self.prefix)
    }

    /// Public URL of an entry behind the CDN.
    pub fn cdn_location(&self, key: &CacheKey) -> Option<String> {
        self.cdn_url
            .as_ref()
            .map(|base| format!("{base}/{}", self.object_key(key)))
    }
}

#[async_trait]
impl CacheStore for RemoteObjectCache {
    #[instrument(skip(self), fields(backend = "remote"))]
    async fn probe(&self, key: &CacheKey) -> StorageResult<bool> {
        self.objects.exists(&self.object_key(key)).await
    }

    #[instrument(skip(self), fields(backend = "remote"))]
    async fn fetch(&self, key: &CacheKey, mode: FetchMode) -> StorageResult<CacheEntry> {
        if mode == FetchMode::Navigation
            && let Some(location) = self.cdn_location(key)
        {
            return Ok(CacheEntry::Redirect(location));
        }

        let object_key = self.object_key(key);
        let meta = self.objects.head(&object_key).await?;
        let stream = self.objects.get_stream(&object_key).await?;
        Ok(CacheEntry::Stream {
            stream,
            length: meta.size,
            content_type: meta.content_type,
        })
    }

    #[instrument(skip(self, data), fields(backend = "remote", size = data.len()))]
    async fn store(&self, key: &CacheKey, data: Bytes, info: EntryInfo<'_>) -> StorageResult<()> {
        let options = PutOptions::default()
            .with_content_type(info.content_type)
            .with_cache_control(format!("public, max-age={CACHED_OBJECT_MAX_AGE}"))
            .with_tag("slug", info.container);
        self.objects
            .put_with(&self.object_key(key), data, &options)
            .await
    }

    fn backend_name(&self) -> &'static str {
        "remote"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.objects.health_check().await
    }
}
