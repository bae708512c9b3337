pub mod monitoring;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use monitoring::{IngestMetrics, INGEST_METRICS};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Healthy when a database connection can be checked out.
async fn health_handler(state: State<Arc<AppState>>) -> (StatusCode, String) {
    match tokio::time::timeout(state.health_timeout, state.pool.get()).await {
        Ok(Ok(_conn)) => (StatusCode::OK, "Healthy".to_string()),
        Ok(Err(err)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("database unavailable: {err}"),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "database unavailable: timed out".to_string(),
        ),
    }
}

async fn expose_metrics(state: State<Arc<AppState>>) -> (StatusCode, String) {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    match encode(&mut buffer, &registry) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(err) => {
            error!(event = "metrics_encode_failed", error = %err);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Registers the pipeline metrics once per process.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;
    if INGEST_METRICS.initialized() {
        return;
    }
    INGEST_METRICS
        .get_or_init(|| async { IngestMetrics::register(&mut registry, "ingest") })
        .await;
    monitoring::register_build_info_metric(&mut registry, "catalog_ingest");
}

/// Starts the health/metrics HTTP server on `addr`; it stops when the shutdown token fires.
pub async fn setup_server(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(event = "metrics_server_listening", bind = %addr);
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "metrics_server_failed", error = %err);
        }
    });

    Ok(server_handle)
}
