//! Prometheus metrics for the prism server.
//!
//! Exposes transform, cache, encode, and upload counters.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no container names, paths, or cache keys, but they do
//! expose aggregate traffic. Restrict the endpoint to scraper IPs at the
//! infrastructure level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Transform metrics
pub static TRANSFORM_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "prism_transform_requests_total",
            "Transform requests by pipeline and outcome",
        ),
        &["kind", "outcome"],
    )
    .expect("metric creation failed")
});

pub static TRANSFORM_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "prism_transform_duration_seconds",
            "Time from request to first response byte",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static CACHE_LOOKUPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("prism_cache_lookups_total", "Cache lookups by result"),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static CACHE_STORES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("prism_cache_stores_total", "Cache writes by result"),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static COALESCED_REQUESTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "prism_coalesced_requests_total",
        "Requests that waited on an identical in-flight transform",
    )
    .expect("metric creation failed")
});

pub static AV_JOBS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("prism_av_jobs_active", "Encodes currently running")
        .expect("metric creation failed")
});

pub static AV_JOBS_KILLED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "prism_av_jobs_killed_total",
        "Encodes killed because the client went away",
    )
    .expect("metric creation failed")
});

// Upload metrics
pub static UPLOAD_CHUNKS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "prism_upload_chunks_total",
        "Total number of Flow chunks stored",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("prism_upload_bytes_total", "Total chunk bytes stored")
        .expect("metric creation failed")
});

pub static UPLOADS_ASSEMBLED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "prism_uploads_assembled_total",
        "Total number of uploads merged into a complete file",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "prism_upload_rejections_total",
            "Rejected Flow chunk requests by reason code",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(TRANSFORM_REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TRANSFORM_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_LOOKUPS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_STORES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COALESCED_REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(AV_JOBS_ACTIVE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(AV_JOBS_KILLED.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(UPLOAD_CHUNKS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_ASSEMBLED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_REJECTIONS.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record one finished transform request.
pub fn record_transform(kind: &str, outcome: &str) {
    TRANSFORM_REQUESTS.with_label_values(&[kind, outcome]).inc();
}

/// Record a rejected Flow chunk.
pub fn record_upload_rejection(reason: &str) {
    UPLOAD_REJECTIONS.with_label_values(&[reason]).inc();
}
