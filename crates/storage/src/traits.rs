//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Object metadata attached on write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// MIME type served with the object.
    pub content_type: Option<String>,
    /// Cache-Control served with the object.
    pub cache_control: Option<String>,
    /// Key/value tags, where the backend supports them.
    pub tags: Vec<(String, String)>,
}

impl PutOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

/// Generic object store: the blob collaborator behind sources, uploads
/// and the remote cache.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object atomically with metadata.
    async fn put_with(&self, key: &str, data: Bytes, options: &PutOptions) -> StorageResult<()>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.put_with(key, data, &PutOptions::default()).await
    }

    /// Start a streaming upload.
    async fn put_stream(
        &self,
        key: &str,
        options: &PutOptions,
    ) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object. Missing objects report `NotFound`.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List objects with a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Drain a byte stream into a streaming upload, aborting on failure.
pub async fn copy_stream(
    mut stream: ByteStream,
    mut upload: Box<dyn StreamingUpload>,
) -> StorageResult<u64> {
    use futures::StreamExt;

    while let Some(chunk) = stream.next().await {
        let written = match chunk {
            Ok(data) => upload.write(data).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(abort_err) = upload.abort().await {
                tracing::warn!(error = %abort_err, "Failed to abort streaming upload");
            }
            return Err(e);
        }
    }
    upload.finish().await
}
