//! Flow chunked-upload rules.
//!
//! A client splits a file into `chunkSize` pieces and submits each one with
//! the Flow fields. The final chunk absorbs the remainder, so an upload has
//! `max(floor(totalSize / chunkSize), 1)` chunks and the last one is between
//! `chunkSize` and `2 * chunkSize - 1` bytes long.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Why a chunk request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowRejection {
    /// Flow fields absent, zero, or empty.
    NonFlowRequest,
    /// No file part, or an empty one.
    InvalidFlowRequest,
    /// Chunk number beyond the chunk count.
    InvalidFlowRequest1,
    /// Declared total exceeds the configured maximum.
    InvalidFlowRequest2,
    /// A non-final chunk whose length differs from the chunk size.
    InvalidFlowRequest3,
    /// The final chunk of a multi-chunk upload has the wrong length.
    InvalidFlowRequest4,
    /// A single-chunk upload whose length differs from the total.
    InvalidFlowRequest5,
}

impl FlowRejection {
    pub fn code(self) -> &'static str {
        match self {
            Self::NonFlowRequest => "non_flow_request",
            Self::InvalidFlowRequest => "invalid_flow_request",
            Self::InvalidFlowRequest1 => "invalid_flow_request1",
            Self::InvalidFlowRequest2 => "invalid_flow_request2",
            Self::InvalidFlowRequest3 => "invalid_flow_request3",
            Self::InvalidFlowRequest4 => "invalid_flow_request4",
            Self::InvalidFlowRequest5 => "invalid_flow_request5",
        }
    }
}

impl fmt::Display for FlowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl std::error::Error for FlowRejection {}

/// Outcome reported after a chunk is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Complete,
    Incomplete,
}

/// The Flow fields describing one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub chunk_number: u64,
    pub chunk_size: u64,
    pub total_size: u64,
    /// Identifier with everything outside `[0-9A-Za-z_-]` removed.
    pub identifier: String,
    pub filename: String,
    /// Client-declared chunk count; informational only.
    pub total_chunks: Option<u64>,
}

impl ChunkDescriptor {
    /// Read the Flow fields from a query string or multipart form.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, FlowRejection> {
        let number = |name: &str| -> Result<u64, FlowRejection> {
            let raw = fields.get(name).ok_or(FlowRejection::NonFlowRequest)?;
            Ok(parse_leading_int(raw))
        };
        let text = |name: &str| -> Result<String, FlowRejection> {
            fields
                .get(name)
                .cloned()
                .ok_or(FlowRejection::NonFlowRequest)
        };

        Ok(Self {
            chunk_number: number("flowChunkNumber")?,
            chunk_size: number("flowChunkSize")?,
            total_size: number("flowTotalSize")?,
            identifier: clean_identifier(&text("flowIdentifier")?),
            filename: text("flowFilename")?,
            total_chunks: fields.get("flowTotalChunks").map(|raw| parse_leading_int(raw)),
        })
    }

    pub fn number_of_chunks(&self) -> u64 {
        number_of_chunks(self.total_size, self.chunk_size)
    }

    pub fn is_final(&self) -> bool {
        self.chunk_number == self.number_of_chunks()
    }

    /// Validate the descriptor and, when known, the received chunk length.
    pub fn validate(
        &self,
        max_file_size: Option<u64>,
        chunk_len: Option<u64>,
    ) -> Result<(), FlowRejection> {
        if self.chunk_number == 0
            || self.chunk_size == 0
            || self.total_size == 0
            || self.identifier.is_empty()
            || self.filename.is_empty()
        {
            return Err(FlowRejection::NonFlowRequest);
        }

        let chunks = self.number_of_chunks();
        if self.chunk_number > chunks {
            return Err(FlowRejection::InvalidFlowRequest1);
        }

        if let Some(max) = max_file_size.filter(|max| *max > 0)
            && self.total_size > max
        {
            return Err(FlowRejection::InvalidFlowRequest2);
        }

        if let Some(len) = chunk_len {
            if self.chunk_number < chunks && len != self.chunk_size {
                return Err(FlowRejection::InvalidFlowRequest3);
            }
            if chunks > 1
                && self.chunk_number == chunks
                && len != (self.total_size % self.chunk_size) + self.chunk_size
            {
                return Err(FlowRejection::InvalidFlowRequest4);
            }
            if chunks == 1 && len != self.total_size {
                return Err(FlowRejection::InvalidFlowRequest5);
            }
        }

        Ok(())
    }
}

/// `max(floor(total / chunk), 1)`; zero chunk size counts as one chunk.
pub fn number_of_chunks(total_size: u64, chunk_size: u64) -> u64 {
    total_size.checked_div(chunk_size).unwrap_or(0).max(1)
}

/// Keep only `[0-9A-Za-z_-]`.
pub fn clean_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Scratch file name for one chunk.
pub fn chunk_file_name(identifier: &str, chunk_number: u64) -> String {
    format!("flow-{}.{chunk_number}", clean_identifier(identifier))
}

/// Integer prefix of a field, `0` when there is none.
fn parse_leading_int(raw: &str) -> u64 {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}
