//! HTTP server for prism.
//!
//! Serves on-demand media transforms backed by a result cache, and
//! reassembles Flow chunked uploads.

pub mod assembler;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod singleflight;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
