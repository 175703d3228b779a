//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let transform_routes = Router::new()
        .route(
            "/{container}/transform/{options}/{file}/{original}",
            get(handlers::transform_with_original),
        )
        .route(
            "/{container}/transform/{options}/{file}",
            get(handlers::transform_with_options),
        )
        .route("/{container}/transform/{file}", get(handlers::transform_inline))
        .route(
            "/{container}/proxy/transform/{*rest}",
            get(handlers::transform_proxy),
        );

    let upload_routes = Router::new()
        .route(
            "/{container}/file/upload",
            get(handlers::check_chunk).post(handlers::upload_chunk),
        )
        .layer(DefaultBodyLimit::max(state.config.server.max_request_bytes));

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(transform_routes)
        .merge(upload_routes);

    // Conditionally add metrics endpoint based on config.
    // SECURITY: When enabled, this endpoint MUST be network-restricted
    // to authorized Prometheus scraper IPs only.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
