//! HTTP request handlers.

pub mod health;
pub mod transform;
pub mod uploads;

pub use health::*;
pub use transform::*;
pub use uploads::*;
