//! Flow chunk storage and merging over a scratch directory.
//!
//! Chunks land in `{scratch}/flow-{identifier}.{n}`. Whenever the final
//! chunk of an upload is written and chunks `1..=N` are all present, they
//! are concatenated into `{scratch}/assembled/{filename}` and removed.

use bytes::Bytes;
use prism_core::flow::{UploadStatus, chunk_file_name};
use prism_core::{ChunkDescriptor, FlowRejection};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Rejected(#[from] FlowRejection),

    #[error("chunk I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of storing one chunk.
#[derive(Debug)]
pub struct ChunkReceipt {
    pub status: UploadStatus,
    /// The merged file, once the upload is complete.
    pub assembled: Option<PathBuf>,
}

/// Stores Flow chunks and merges complete uploads.
#[derive(Debug)]
pub struct FlowAssembler {
    scratch_dir: PathBuf,
    max_file_size: Option<u64>,
}

impl FlowAssembler {
    pub async fn open(
        scratch_dir: impl Into<PathBuf>,
        max_file_size: Option<u64>,
    ) -> std::io::Result<Self> {
        let scratch_dir = scratch_dir.into();
        tokio::fs::create_dir_all(scratch_dir.join("assembled")).await?;
        Ok(Self {
            scratch_dir,
            max_file_size,
        })
    }

    pub fn chunk_path(&self, identifier: &str, chunk_number: u64) -> PathBuf {
        self.scratch_dir
            .join(chunk_file_name(identifier, chunk_number))
    }

    fn assembled_path(&self, descriptor: &ChunkDescriptor) -> Result<PathBuf, FlowRejection> {
        // Client file names never escape the scratch directory.
        let name = Path::new(&descriptor.filename)
            .file_name()
            .ok_or(FlowRejection::NonFlowRequest)?;
        Ok(self.scratch_dir.join("assembled").join(name))
    }

    /// Whether a chunk is already stored, so a resuming client can skip it.
    pub async fn has_chunk(&self, descriptor: &ChunkDescriptor) -> Result<bool, AssemblyError> {
        descriptor.validate(self.max_file_size, None)?;
        Ok(tokio::fs::try_exists(self.chunk_path(&descriptor.identifier, descriptor.chunk_number))
            .await?)
    }

    /// Validate and store a chunk, merging the upload when it is complete.
    pub async fn save_chunk(
        &self,
        descriptor: &ChunkDescriptor,
        data: Bytes,
    ) -> Result<ChunkReceipt, AssemblyError> {
        if data.is_empty() {
            return Err(FlowRejection::InvalidFlowRequest.into());
        }
        descriptor.validate(self.max_file_size, Some(data.len() as u64))?;
        let destination = self.assembled_path(descriptor)?;

        let chunk_path = self.chunk_path(&descriptor.identifier, descriptor.chunk_number);
        write_atomically(&chunk_path, &data).await?;

        let chunks = descriptor.number_of_chunks();
        let mut probe = 1;
        while probe <= chunks
            && tokio::fs::try_exists(self.chunk_path(&descriptor.identifier, probe)).await?
        {
            probe += 1;
        }
        let all_present = probe > chunks;

        if !(all_present && descriptor.is_final()) {
            return Ok(ChunkReceipt {
                status: UploadStatus::Incomplete,
                assembled: None,
            });
        }

        self.merge(&descriptor.identifier, chunks, &destination)
            .await?;
        self.remove_chunks(&descriptor.identifier).await?;
        tracing::info!(
            identifier = %descriptor.identifier,
            filename = %descriptor.filename,
            chunks,
            size = descriptor.total_size,
            "Upload assembled"
        );

        Ok(ChunkReceipt {
            status: UploadStatus::Complete,
            assembled: Some(destination),
        })
    }

    async fn merge(&self, identifier: &str, chunks: u64, destination: &Path) -> std::io::Result<()> {
        let temp = temp_sibling(destination);
        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            for n in 1..=chunks {
                let mut chunk = tokio::fs::File::open(self.chunk_path(identifier, n)).await?;
                tokio::io::copy(&mut chunk, &mut file).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp, destination).await
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result
    }

    /// Delete chunk files from 1 upward until the first missing one.
    pub async fn remove_chunks(&self, identifier: &str) -> std::io::Result<()> {
        let mut n = 1;
        loop {
            match tokio::fs::remove_file(self.chunk_path(identifier, n)).await {
                Ok(()) => n += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream the stored chunks, in order, into `sink`. Returns bytes written.
    pub async fn write<W>(&self, identifier: &str, sink: &mut W) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        let mut n = 1;
        loop {
            let mut chunk = match tokio::fs::File::open(self.chunk_path(identifier, n)).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e),
            };
            written += tokio::io::copy(&mut chunk, sink).await?;
            n += 1;
        }
        sink.flush().await?;
        Ok(written)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp.{}", uuid::Uuid::new_v4()))
}

async fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp = temp_sibling(path);
    if let Err(e) = tokio::fs::write(&temp, data).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    tokio::fs::rename(&temp, path).await
}
