pub mod error;
pub mod health;
pub mod metrics;
pub mod owner;
pub mod videos;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// API routes plus the Prometheus scrape endpoint.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/videos", get(videos::list_videos))
        .route("/api/v1/videos/generate", post(videos::generate_video))
        .route("/api/v1/videos/{id}", get(videos::get_video))
        .route("/api/v1/videos/{id}/cancel", post(videos::cancel_video))
        .route("/api/v1/ws/videos/{id}", get(ws::job_events))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route("/metrics", get(metrics::prometheus_metrics).with_state(prometheus))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024))
}
