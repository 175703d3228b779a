//! Test fixtures for generating test data.

use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Multipart boundary used by [`flow_chunk_body`].
pub const BOUNDARY: &str = "prism-test-boundary";

/// Generate deterministic test data based on a seed.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Encode a gradient image of the given size.
#[allow(dead_code)]
pub fn test_image(width: u32, height: u32, format: ImageFormat) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).expect("Failed to encode test image");
    Bytes::from(out.into_inner())
}

/// The Flow fields for one chunk.
#[allow(dead_code)]
pub struct FlowChunk<'a> {
    pub number: u64,
    pub chunk_size: u64,
    pub total_size: u64,
    pub identifier: &'a str,
    pub filename: &'a str,
}

#[allow(dead_code)]
impl FlowChunk<'_> {
    /// Query string for the existence probe.
    pub fn query(&self) -> String {
        format!(
            "flowChunkNumber={}&flowChunkSize={}&flowTotalSize={}&flowIdentifier={}&flowFilename={}",
            self.number, self.chunk_size, self.total_size, self.identifier, self.filename
        )
    }

    fn total_chunks(&self) -> u64 {
        (self.total_size / self.chunk_size).max(1)
    }
}

/// Build a `multipart/form-data` body carrying a Flow chunk.
#[allow(dead_code)]
pub fn flow_chunk_body(chunk: &FlowChunk<'_>, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    let fields = [
        ("flowChunkNumber", chunk.number.to_string()),
        ("flowChunkSize", chunk.chunk_size.to_string()),
        ("flowTotalSize", chunk.total_size.to_string()),
        ("flowTotalChunks", chunk.total_chunks().to_string()),
        ("flowIdentifier", chunk.identifier.to_string()),
        ("flowFilename", chunk.filename.to_string()),
    ];
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}
