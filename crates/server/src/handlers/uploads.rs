//! Flow chunked-upload handlers.

use crate::assembler::{AssemblyError, ChunkReceipt};
use crate::error::{ApiError, ApiResult};
use crate::metrics::{UPLOAD_BYTES, UPLOAD_CHUNKS, UPLOADS_ASSEMBLED, record_upload_rejection};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use bytes::Bytes;
use futures::TryStreamExt;
use prism_core::flow::UploadStatus;
use prism_core::format::mime_for_extension;
use prism_core::{CACHED_OBJECT_MAX_AGE, ChunkDescriptor, FlowRejection};
use prism_storage::{ByteStream, PutOptions, StorageError, copy_stream};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path as FsPath;
use tokio_util::io::ReaderStream;

/// Multipart field carrying the chunk bytes.
const FILE_FIELD: &str = "file";

/// Response to a stored chunk.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub status: UploadStatus,
    pub filename: String,
    /// File name the client attached to the `file` part.
    pub original_filename: Option<String>,
    pub identifier: String,
}

impl From<AssemblyError> for ApiError {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::Rejected(rejection) => Self::Upload(rejection),
            AssemblyError::Io(e) => Self::Internal(format!("chunk storage failed: {e}")),
        }
    }
}

fn rejected(rejection: FlowRejection) -> ApiError {
    record_upload_rejection(rejection.code());
    ApiError::Upload(rejection)
}

fn track(e: AssemblyError) -> ApiError {
    if let AssemblyError::Rejected(rejection) = &e {
        record_upload_rejection(rejection.code());
    }
    e.into()
}

/// GET /{container}/file/upload - Does the chunk already exist?
///
/// 200 when it does, 204 when it does not, so clients can resume.
pub async fn check_chunk(
    State(state): State<AppState>,
    Path(_container): Path<String>,
    Query(fields): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    let descriptor = ChunkDescriptor::from_fields(&fields).map_err(rejected)?;
    let present = state.uploads.has_chunk(&descriptor).await.map_err(track)?;
    Ok(if present {
        StatusCode::OK
    } else {
        StatusCode::NO_CONTENT
    })
}

/// POST /{container}/file/upload - Store one chunk.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path(container): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<ChunkResponse>> {
    let mut fields = HashMap::new();
    let mut file: Option<(Bytes, Option<String>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        if name == FILE_FIELD {
            let original = field.file_name().map(str::to_owned);
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            file = Some((data, original));
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            fields.insert(name, value);
        }
    }

    let descriptor = ChunkDescriptor::from_fields(&fields).map_err(rejected)?;
    let (data, original_filename) = file.unwrap_or_default();
    let size = data.len() as u64;

    let ChunkReceipt { status, assembled } = state
        .uploads
        .save_chunk(&descriptor, data)
        .await
        .map_err(track)?;
    UPLOAD_CHUNKS.inc();
    UPLOAD_BYTES.inc_by(size);
    tracing::debug!(
        identifier = %descriptor.identifier,
        chunk = descriptor.chunk_number,
        of = descriptor.number_of_chunks(),
        size,
        "Chunk stored"
    );

    if let Some(path) = assembled {
        UPLOADS_ASSEMBLED.inc();
        if state.config.upload.publish {
            publish(&state, &container, &path).await?;
        }
    }

    Ok(Json(ChunkResponse {
        status,
        filename: descriptor.filename,
        original_filename,
        identifier: descriptor.identifier,
    }))
}

/// Copy an assembled file into the source store as `{container}/{name}`.
async fn publish(state: &AppState, container: &str, path: &FsPath) -> ApiResult<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ApiError::Internal(format!("unnamed upload: {}", path.display())))?;
    let key = format!("{container}/{name}");
    let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    let options = PutOptions::default()
        .with_content_type(mime_for_extension(ext))
        .with_cache_control(format!("public, max-age={CACHED_OBJECT_MAX_AGE}"));

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to open assembled upload: {e}")))?;
    let stream: ByteStream = Box::pin(ReaderStream::new(file).map_err(StorageError::from));
    let upload = state.storage.put_stream(&key, &options).await?;
    let written = copy_stream(stream, upload).await?;

    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove published upload");
    }
    tracing::info!(key = %key, size = written, "Upload published");
    Ok(())
}
