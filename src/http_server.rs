//! A small ambient HTTP server exposing health and Prometheus metrics.
//!
//! Grounded in the teacher's `HttpServer`, trimmed to the two routes this
//! crate actually needs: cluster registry, config reload, and rate
//! limiter stats from the teacher don't apply here since none of those
//! subsystems exist in this crate's scope.

use crate::metrics::ContentMetrics;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
struct AppState {
    metrics: Arc<ContentMetrics>,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    opening: i64,
    established: i64,
}

pub fn router(metrics: Arc<ContentMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .with_state(AppState { metrics })
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthReport {
        status: "ok",
        opening: state.metrics.opening.get(),
        established: state.metrics.established.get(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry().gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "failed to encode metrics"})),
        )
            .into_response();
    }
    (axum::http::StatusCode::OK, buf).into_response()
}

pub async fn serve(addr: SocketAddr, metrics: Arc<ContentMetrics>) -> std::io::Result<()> {
    let app = router(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "ambient http server listening");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = router(Arc::new(ContentMetrics::new()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_registered_gauges() {
        let app = router(Arc::new(ContentMetrics::new()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
