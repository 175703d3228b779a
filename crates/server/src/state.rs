//! Application state shared across handlers.

use crate::assembler::FlowAssembler;
use crate::error::{ApiError, ApiResult};
use crate::singleflight::SingleFlight;
use prism_core::config::AppConfig;
use prism_storage::{CacheStore, ObjectStore};
use prism_transform::Transformer;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Source asset store; completed uploads are published here.
    pub storage: Arc<dyn ObjectStore>,
    /// Finished transform outputs.
    pub cache: Arc<dyn CacheStore>,
    pub transformer: Arc<Transformer>,
    /// In-flight transforms by cache key.
    pub flights: Arc<SingleFlight>,
    pub uploads: Arc<FlowAssembler>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        cache: Arc<dyn CacheStore>,
        transformer: Transformer,
        uploads: FlowAssembler,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            cache,
            transformer: Arc::new(transformer),
            flights: Arc::new(SingleFlight::new()),
            uploads: Arc::new(uploads),
        }
    }

    /// Build every collaborator from configuration.
    pub async fn from_config(config: AppConfig) -> ApiResult<Self> {
        config.validate().map_err(ApiError::BadRequest)?;

        let storage = prism_storage::from_config(&config.storage).await?;
        let cache = prism_storage::cache::from_config(&config.cache, storage.clone()).await?;
        let transformer = Transformer::from_config(&config.transform, storage.clone()).await?;
        let uploads = FlowAssembler::open(&config.upload.scratch_dir, config.upload.max_file_size())
            .await
            .map_err(|e| ApiError::Internal(format!("failed to open upload scratch: {e}")))?;

        tracing::info!(
            storage = storage.backend_name(),
            cache = cache.backend_name(),
            "Application state initialized"
        );
        Ok(Self::new(config, storage, cache, transformer, uploads))
    }
}
