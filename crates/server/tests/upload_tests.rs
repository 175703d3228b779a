//! Integration tests for Flow chunked uploads.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use common::{BOUNDARY, FlowChunk, TestServer, body_json, flow_chunk_body, seeded_bytes};
use serde_json::Value;

const MB: u64 = 1024 * 1024;

async fn post_chunk(server: &TestServer, chunk: &FlowChunk<'_>, data: &[u8]) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/acme/file/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(flow_chunk_body(chunk, data)))
        .unwrap();
    let response = server.send(request).await;
    let status = response.status();
    (status, body_json(response).await)
}

async fn probe(server: &TestServer, chunk: &FlowChunk<'_>) -> StatusCode {
    server
        .get(&format!("/acme/file/upload?{}", chunk.query()))
        .await
        .status()
}

fn chunk(number: u64, chunk_size: u64, total_size: u64) -> FlowChunk<'static> {
    FlowChunk {
        number,
        chunk_size,
        total_size,
        identifier: "10485760-moviemp4",
        filename: "movie.mp4",
    }
}

#[tokio::test]
async fn ten_chunk_upload_assembles_and_publishes() {
    let server = TestServer::with_config(|config| config.upload.publish = true).await;
    let data = seeded_bytes(42, (10 * MB) as usize);

    for n in 1..=9 {
        let start = ((n - 1) * MB) as usize;
        let (status, body) =
            post_chunk(&server, &chunk(n, MB, 10 * MB), &data[start..start + MB as usize]).await;
        assert_eq!(status, StatusCode::OK, "chunk {n}: {body}");
        assert_eq!(body["status"], "incomplete");
        assert_eq!(body["filename"], "movie.mp4");
        assert_eq!(body["identifier"], "10485760-moviemp4");
    }

    let (status, body) = post_chunk(&server, &chunk(10, MB, 10 * MB), &data[(9 * MB) as usize..]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "complete");
    assert_eq!(body["filename"], "movie.mp4");
    assert_eq!(body["originalFilename"], "blob");

    let published = server.state.storage.get("acme/movie.mp4").await.unwrap();
    assert_eq!(published.len() as u64, 10 * MB);
    assert_eq!(published, data);

    // Chunk files are gone once merged.
    assert_eq!(probe(&server, &chunk(1, MB, 10 * MB)).await, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn probe_reports_stored_chunks() {
    let server = TestServer::new().await;
    let first = chunk(1, 100, 250);

    assert_eq!(probe(&server, &first).await, StatusCode::NO_CONTENT);
    let (status, _) = post_chunk(&server, &first, &[7u8; 100]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(probe(&server, &first).await, StatusCode::OK);
    assert_eq!(probe(&server, &chunk(2, 100, 250)).await, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unpublished_uploads_stay_in_scratch() {
    let server = TestServer::new().await;

    let (status, body) = post_chunk(&server, &chunk(1, 100, 100), &[1u8; 100]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "complete");

    let assembled = server
        .state
        .config
        .upload
        .scratch_dir
        .join("assembled")
        .join("movie.mp4");
    assert_eq!(std::fs::read(assembled).unwrap(), vec![1u8; 100]);
    assert!(!server.state.storage.exists("acme/movie.mp4").await.unwrap());
}

#[tokio::test]
async fn rejected_chunks_report_reason_codes() {
    let server = TestServer::with_config(|config| config.upload.max_file_size = 1000).await;

    let cases: [(FlowChunk<'static>, Bytes, &str); 5] = [
        (chunk(4, 100, 250), Bytes::from(vec![0; 100]), "invalid_flow_request1"),
        (chunk(1, 100, 5000), Bytes::from(vec![0; 100]), "invalid_flow_request2"),
        (chunk(1, 100, 250), Bytes::from(vec![0; 99]), "invalid_flow_request3"),
        (chunk(2, 100, 250), Bytes::from(vec![0; 100]), "invalid_flow_request4"),
        (chunk(1, 100, 150), Bytes::from(vec![0; 100]), "invalid_flow_request5"),
    ];
    for (chunk, data, code) in cases {
        let (status, body) = post_chunk(&server, &chunk, &data).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{code}");
        assert_eq!(body["code"], code);
    }

    let (status, body) = post_chunk(&server, &chunk(1, 100, 100), &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_flow_request");

    let (status, body) = post_chunk(&server, &chunk(0, 100, 100), &[1u8; 100]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "non_flow_request");
}

#[tokio::test]
async fn probe_without_flow_fields_is_rejected() {
    let server = TestServer::new().await;

    let response = server.get("/acme/file/upload").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "non_flow_request");
}
