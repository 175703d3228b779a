use bytes::Bytes;
use prism_core::{CacheKey, Directives, OutputFormat, SourceLocator};

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Cache key for `acme/{file}` transformed by `tokens`.
pub fn cache_key(file: &str, tokens: &str) -> CacheKey {
    let settings = Directives::Tokens(tokens.to_string()).parse().unwrap();
    let source = SourceLocator::object("acme", file).unwrap();
    let format = OutputFormat::resolve(&settings, source.extension().as_deref()).unwrap();
    CacheKey::derive(&source, &settings, &format)
}
