//! Source fetching and transform engines for prism.
//!
//! A [`TransformRequest`] is validated up front. [`Transformer::run`] then
//! fetches the source and dispatches it either to the image pipeline, which
//! returns finished bytes, or to the audio/video engine, which returns a
//! placeholder with a handle on the running encode.

pub mod av;
pub mod error;
pub mod imaging;
pub mod request;
pub mod source;

pub use av::{
    AvConfig, AvEngine, Completion, EncodeCommand, EncodeJob, EncodeRunner, FfmpegRunner, JobHandle, KillOnDrop,
    PendingEncode, Progress,
};
pub use error::{EngineResult, TransformError};
pub use request::{TransformPlan, TransformRequest};
pub use source::SourceFetcher;

use bytes::Bytes;
use prism_core::config::TransformConfig;
use prism_storage::{ByteStream, CacheEntry, ObjectStore};
use std::sync::Arc;

/// What a request resolves to.
pub enum TransformResult {
    /// Finished bytes.
    Ready(Bytes),
    /// Finished bytes streamed from a cache.
    Stream { stream: ByteStream, length: u64 },
    /// An encode was started or is already running.
    Pending(PendingEncode),
    /// The result lives elsewhere.
    Redirect(String),
}

impl TransformResult {
    /// A cache hit as a result; `None` for a miss.
    pub fn from_cache(entry: CacheEntry) -> Option<Self> {
        match entry {
            CacheEntry::Bytes { data, .. } => Some(Self::Ready(data)),
            CacheEntry::Stream { stream, length, .. } => Some(Self::Stream { stream, length }),
            CacheEntry::Redirect(location) => Some(Self::Redirect(location)),
            CacheEntry::Miss => None,
        }
    }
}

impl std::fmt::Debug for TransformResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(data) => f.debug_tuple("Ready").field(&data.len()).finish(),
            Self::Stream { length, .. } => f.debug_struct("Stream").field("length", length).finish(),
            Self::Pending(pending) => f
                .debug_struct("Pending")
                .field("new_job", &pending.job.is_some())
                .finish(),
            Self::Redirect(location) => f.debug_tuple("Redirect").field(location).finish(),
        }
    }
}

/// Runs transform requests.
pub struct Transformer {
    sources: SourceFetcher,
    av: AvEngine,
}

impl Transformer {
    pub fn new(sources: SourceFetcher, av: AvEngine) -> Self {
        Self { sources, av }
    }

    /// Build the engines from configuration, reading sources from `objects`.
    pub async fn from_config(
        config: &TransformConfig,
        objects: Arc<dyn ObjectStore>,
    ) -> EngineResult<Self> {
        let sources =
            SourceFetcher::new(objects, config.fetch_timeout(), config.max_source_bytes)?;
        let placeholder = match &config.placeholder_path {
            Some(path) => Bytes::from(tokio::fs::read(path).await?),
            None => Bytes::new(),
        };
        let av = AvEngine::open(
            AvConfig::from(config),
            sources.clone(),
            Arc::new(FfmpegRunner),
            placeholder,
        )
        .await?;
        Ok(Self::new(sources, av))
    }

    pub fn av(&self) -> &AvEngine {
        &self.av
    }

    pub async fn run(&self, request: &TransformRequest) -> EngineResult<TransformResult> {
        match &request.plan {
            TransformPlan::Image(options) => {
                let source = self.sources.fetch(&request.source).await?;
                let bytes =
                    imaging::transform(source, options.clone(), request.format.clone()).await?;
                tracing::debug!(key = %request.key, size = bytes.len(), "Image transformed");
                Ok(TransformResult::Ready(bytes))
            }
            TransformPlan::Av(options) => {
                let pending = self
                    .av
                    .start(&request.key, &request.source, &request.format, options)
                    .await?;
                Ok(TransformResult::Pending(pending))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use prism_core::{Directives, SourceLocator};
    use prism_storage::FilesystemBackend;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn png(width: u32, height: u32) -> Bytes {
        let img = RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        Bytes::from(out.into_inner())
    }

    async fn transformer(dir: &std::path::Path) -> (Arc<dyn ObjectStore>, Transformer) {
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(dir.join("store")).await.unwrap());
        let config = TransformConfig {
            scratch_dir: dir.join("scratch"),
            ..TransformConfig::default()
        };
        let transformer = Transformer::from_config(&config, objects.clone()).await.unwrap();
        (objects, transformer)
    }

    fn request(tokens: &str, file: &str, ext: &str) -> TransformRequest {
        let settings = Directives::Tokens(tokens.to_string()).parse().unwrap();
        TransformRequest::new(
            SourceLocator::object("acme", file).unwrap(),
            settings,
            Some(ext),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn image_requests_finish_inline() {
        let dir = tempdir().unwrap();
        let (objects, transformer) = transformer(dir.path()).await;
        objects.put("acme/photo.png", png(400, 200)).await.unwrap();

        let req = request("w_200,f_webp", "photo.png", "png");
        match transformer.run(&req).await.unwrap() {
            TransformResult::Ready(bytes) => {
                let out = image::load_from_memory(&bytes).unwrap();
                assert_eq!((out.width(), out.height()), (200, 100));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_image_source_is_upstream_404() {
        let dir = tempdir().unwrap();
        let (_objects, transformer) = transformer(dir.path()).await;

        let req = request("w_200", "nope.jpg", "jpg");
        let err = transformer.run(&req).await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(404));
    }

    #[test]
    fn cache_entries_map_to_results() {
        assert!(TransformResult::from_cache(CacheEntry::Miss).is_none());
        assert!(matches!(
            TransformResult::from_cache(CacheEntry::Redirect("https://cdn/x".to_string())),
            Some(TransformResult::Redirect(_))
        ));
        assert!(matches!(
            TransformResult::from_cache(CacheEntry::Bytes {
                data: Bytes::from_static(b"x"),
                content_type: None,
            }),
            Some(TransformResult::Ready(_))
        ));
    }
}
