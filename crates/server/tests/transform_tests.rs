//! Integration tests for the transform endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{PLACEHOLDER, TestServer, body_bytes, body_json, seeded_bytes, test_image};
use image::ImageFormat;
use std::time::Duration;

async fn server_with_photo() -> TestServer {
    let server = TestServer::new().await;
    server
        .put_source("acme/photo.jpg", test_image(400, 300, ImageFormat::Jpeg))
        .await;
    server
}

#[tokio::test]
async fn resizes_and_converts_to_webp() {
    let server = server_with_photo().await;

    let response = server
        .get("/acme/transform/w_200,h_100,g_north,f_webp/photo.jpg")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/webp");
    assert_eq!(response.headers()["cache-tag"], "acme");
    assert_eq!(response.headers()["x-cached-response"], "false");
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert!(
        response.headers()["x-time-elapsed"]
            .to_str()
            .unwrap()
            .ends_with("ms")
    );

    let body = body_bytes(response).await;
    let out = image::load_from_memory_with_format(&body, ImageFormat::WebP).unwrap();
    assert_eq!((out.width(), out.height()), (200, 100));
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let server = server_with_photo().await;
    let uri = "/acme/transform/w_120,f_png/photo.jpg";

    let first = server.get(uri).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cached-response"], "false");
    let first_body = body_bytes(first).await;

    let cached = server.get_cached(uri).await;
    assert_eq!(cached.status(), StatusCode::OK);
    assert_eq!(cached.headers()["content-type"], "image/png");
    assert_eq!(body_bytes(cached).await, first_body);
}

#[tokio::test]
async fn directive_order_shares_one_cache_entry() {
    let server = server_with_photo().await;

    let first = body_bytes(server.get_cached("/acme/transform/w_80,q_70/photo.jpg").await).await;

    let reordered = server.get("/acme/transform/q:70;w:80/photo.jpg").await;
    assert_eq!(reordered.headers()["x-cached-response"], "true");
    assert_eq!(body_bytes(reordered).await, first);
}

#[tokio::test]
async fn extension_addressing_matches_format_directive() {
    let server = server_with_photo().await;

    let first = server.get_cached("/acme/transform/w_64/photo.jpg.webp").await;
    assert_eq!(first.headers()["content-type"], "image/webp");

    for uri in [
        "/acme/transform/w_64,f_webp/photo.jpg",
        "/acme/transform/w_64/photo.jpg/holiday.webp",
    ] {
        let response = server.get(uri).await;
        assert_eq!(response.headers()["x-cached-response"], "true", "{uri}");
        assert_eq!(response.headers()["content-type"], "image/webp");
    }
}

#[tokio::test]
async fn inline_json_settings() {
    let server = server_with_photo().await;

    let response = server
        .get("/acme/transform/photo.jpg?%7B%22w%22%3A100%2C%22f%22%3A%22png%22%7D")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");

    let out = image::load_from_memory(&body_bytes(response).await).unwrap();
    assert_eq!(out.width(), 100);
}

#[tokio::test]
async fn range_requests_get_partial_content() {
    let server = server_with_photo().await;
    let uri = "/acme/transform/w_50,f_png/photo.jpg";

    let full = body_bytes(server.get(uri).await).await;

    let request = Request::builder()
        .uri(uri)
        .header("range", "bytes=0-9")
        .body(Body::empty())
        .unwrap();
    let response = server.send(request).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()["content-range"],
        format!("bytes 0-9/{}", full.len()).as_str()
    );
    assert_eq!(body_bytes(response).await, full.slice(0..10));
}

#[tokio::test]
async fn bare_file_route_without_inline_settings_is_rejected() {
    let server = server_with_photo().await;

    let response = server.get("/acme/transform/photo.jpg").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "invalid_settings");
}

#[tokio::test]
async fn unknown_output_format_is_unsupported() {
    let server = server_with_photo().await;

    let response = server.get("/acme/transform/w_100/photo.jpg.xyz").await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body_json(response).await["code"], "unsupported_format");

    let response = server.get("/acme/transform/f_m3u8/photo.jpg").await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn missing_source_is_not_found() {
    let server = TestServer::new().await;

    let response = server.get("/acme/transform/w_100/nope.jpg").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "upstream_fetch");
}

#[tokio::test]
async fn video_requests_get_a_placeholder_then_the_encode() {
    let server = TestServer::new().await;
    server
        .put_source("acme/clip.mov", seeded_bytes(7, 32 * 1024))
        .await;
    let uri = "/acme/transform/w_320/clip.mov.mp4";

    let response = server.get(uri).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["content-type"], "video/mp4");
    assert_eq!(
        response.headers()["cache-control"],
        "private, no-cache, no-store, must-revalidate"
    );
    assert_eq!(response.headers()["x-cached-response"], "false");
    assert_eq!(&body_bytes(response).await[..], PLACEHOLDER);

    let cached = server.get_cached(uri).await;
    assert_eq!(cached.status(), StatusCode::OK);
    assert_eq!(body_bytes(cached).await.len(), 4096);
    assert!(server.encoder.calls() >= 1);
}

#[tokio::test]
async fn cache_hits_skip_the_encoder() {
    let server = TestServer::new().await;
    server
        .put_source("acme/clip.mov", seeded_bytes(11, 8 * 1024))
        .await;
    let uri = "/acme/transform/w_160/clip.mov.webm";

    server.get_cached(uri).await;
    let encodes = server.encoder.calls();

    for _ in 0..3 {
        let response = server.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cached-response"], "true");
        assert_eq!(body_bytes(response).await.len(), 4096);
    }
    assert_eq!(server.encoder.calls(), encodes);
}

#[tokio::test]
async fn concurrent_misses_share_one_encode() {
    let server = TestServer::new().await;
    server
        .put_source("acme/clip.mov", seeded_bytes(12, 8 * 1024))
        .await;
    let uri = "/acme/transform/ph_0,w_64/clip.mov.mp4";

    server.encoder.hold();
    let first = server.spawn_get(uri);
    server.encoder.wait_for_calls(1).await;
    let others: Vec<_> = (0..4).map(|_| server.spawn_get(uri)).collect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.encoder.release();

    for handle in std::iter::once(first).chain(others) {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cached-response"], "false");
        assert_eq!(body_bytes(response).await.len(), 4096);
    }
    assert_eq!(server.encoder.calls(), 1);
}

#[tokio::test]
async fn dropped_ph_0_request_kills_the_encode() {
    let server = TestServer::new().await;
    server
        .put_source("acme/clip.mov", seeded_bytes(13, 8 * 1024))
        .await;
    let uri = "/acme/transform/ph_0,w_64/clip.mov.webm";

    server.encoder.hold();
    let request = server.spawn_get(uri);
    server.encoder.wait_for_calls(1).await;
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.encoder.killed() == 0 || server.state.transformer.av().active_jobs() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "encode was never killed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The key is free again: a new request starts a fresh encode.
    server.encoder.release();
    let response = server.get(uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.len(), 4096);
    assert_eq!(server.encoder.calls(), 2);
}

#[tokio::test]
async fn oversized_resizes_are_rejected() {
    let server = server_with_photo().await;

    for uri in [
        "/acme/transform/w_100000,h_100000/photo.jpg",
        "/acme/transform/w_16000,h_10,g_north/photo.jpg",
    ] {
        let response = server.get(uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body_json(response).await["code"], "invalid_settings");
    }
}

#[tokio::test]
async fn placeholder_honors_range() {
    let server = TestServer::new().await;
    server
        .put_source("acme/clip.mov", seeded_bytes(14, 8 * 1024))
        .await;
    server.encoder.hold();

    let request = Request::builder()
        .uri("/acme/transform/w_64/clip.mov.mp4")
        .header("range", "bytes=0-4")
        .body(Body::empty())
        .unwrap();
    let response = server.send(request).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()["content-range"],
        format!("bytes 0-4/{}", PLACEHOLDER.len()).as_str()
    );
    assert_eq!(response.headers()["pragma"], "no-cache");
    assert_eq!(&body_bytes(response).await[..], &PLACEHOLDER[..5]);
    server.encoder.release();
}

#[tokio::test]
async fn ph_0_waits_for_the_encode() {
    let server = TestServer::new().await;
    server
        .put_source("acme/clip.mov", seeded_bytes(9, 16 * 1024))
        .await;

    let response = server.get("/acme/transform/ph_0,f_webm/clip.mov").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/webm");
    assert_eq!(response.headers()["x-cached-response"], "false");
    assert_eq!(body_bytes(response).await.len(), 4096);
}

#[tokio::test]
async fn health_and_metrics() {
    let server = server_with_photo().await;
    server.get("/acme/transform/w_10/photo.jpg").await;

    let health = server.get("/health").await;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await["status"], "ok");

    let metrics = server.get("/metrics").await;
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(metrics).await.to_vec()).unwrap();
    assert!(text.contains("prism_transform_requests_total"));
    assert!(text.contains("prism_cache_lookups_total"));
}

#[tokio::test]
async fn metrics_can_be_disabled() {
    let server = TestServer::with_config(|config| config.server.metrics_enabled = false).await;
    assert_eq!(server.get("/metrics").await.status(), StatusCode::NOT_FOUND);
}
