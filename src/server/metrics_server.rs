// src/server/metrics_server.rs

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::core::metrics::gather_metrics;
use super::context::FleetState;

/// Handles HTTP requests to the /metrics endpoint. All gauges are kept
/// current by the event-bus sink and the components that own them, so this
/// handler only needs to gather and encode (§4.13).
async fn metrics_handler() -> impl IntoResponse {
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs the Prometheus metrics HTTP server on `metrics.port` until shutdown.
pub async fn run_metrics_server(state: Arc<FleetState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = state.config.current().metrics.port;
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("metrics server listening on http://{addr}/metrics");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind metrics server on port {port}: {e}");
            return;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("metrics server shutting down");
        })
        .await
        .unwrap();
}
