pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{cache_key, seeded_bytes};
