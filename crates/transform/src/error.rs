//! Transform error types.

use prism_storage::StorageError;
use thiserror::Error;

/// Errors raised while fetching, decoding, or encoding media.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Settings or format problems detected before any I/O.
    #[error(transparent)]
    Request(#[from] prism_core::Error),

    /// The upstream answered with a non-success status.
    #[error("upstream fetch of {locator} failed with status {status}")]
    UpstreamFetch { locator: String, status: u16 },

    /// The upstream could not be reached or the body could not be read.
    #[error("upstream fetch of {locator} failed: {message}")]
    UpstreamUnavailable { locator: String, message: String },

    #[error("source of {size} bytes exceeds the {limit} byte limit")]
    SourceTooLarge { size: u64, limit: u64 },

    #[error("failed to decode source image: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransformError {
    /// Upstream status for fetch failures.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::UpstreamFetch { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for transform operations.
pub type EngineResult<T> = std::result::Result<T, TransformError>;
