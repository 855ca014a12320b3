//! Metrics and probe HTTP endpoint.
//!
//! - `GET /metrics` - Prometheus text exposition of the controller metrics
//! - `GET /healthz` - liveness probe

use crate::metrics::PrometheusMetrics;
use anyhow::Result;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Routes of the metrics endpoint
pub fn router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Serve the metrics endpoint until the listener fails
pub async fn serve(addr: SocketAddr, metrics: Arc<PrometheusMetrics>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(metrics)).await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}
