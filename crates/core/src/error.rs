//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid source path: {0}")]
    InvalidSource(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
