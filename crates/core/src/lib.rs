//! Core domain types and shared logic for the prism media server.
//!
//! This crate defines the data model used across all other crates:
//! - Directive grammar and normalized settings
//! - Cache key derivation from source locator and settings
//! - Output format and MIME resolution
//! - Typed image and audio/video transform options
//! - Flow chunked-upload validation rules

pub mod cache_key;
pub mod config;
pub mod error;
pub mod flow;
pub mod format;
pub mod options;
pub mod settings;
pub mod source;

pub use cache_key::CacheKey;
pub use error::{Error, Result};
pub use flow::{ChunkDescriptor, FlowRejection};
pub use format::{MediaFormat, MediaKind, OutputFormat};
pub use options::{AvOptions, ImageOptions};
pub use settings::{Directives, SettingValue, Settings};
pub use source::SourceLocator;

/// Results smaller than this are treated as a failed encode.
pub const MIN_OUTPUT_BYTES: u64 = 1024;

/// Cache-Control applied to persisted transform results (one year).
pub const CACHED_OBJECT_MAX_AGE: u64 = 31_536_000;
