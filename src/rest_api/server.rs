//! Axum HTTP server exposing `/healthz`, `/readyz`, and `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};
use crate::inventory::NodeInventory;

#[derive(Clone)]
struct AppState {
    inventory: Arc<NodeInventory>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.inventory.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "syncing node inventory")
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    use prometheus_client::encoding::text::encode;
    let registry = crate::controller::metrics::registry();
    let mut buffer = String::new();
    encode(&mut buffer, &registry).unwrap();
    buffer
}

/// Serve the health/readiness/metrics endpoints until the process shuts down.
pub async fn run_server(listen_addr: &str, inventory: Arc<NodeInventory>) -> Result<()> {
    let state = AppState { inventory };

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    #[cfg(feature = "metrics")]
    {
        router = router.route("/metrics", get(metrics_handler));
    }

    let addr: SocketAddr = listen_addr.parse().map_err(|e| Error::ConfigFatal(format!("invalid http.listen-addr: {e}")))?;
    info!(%addr, "REST API server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigFatal(format!("failed to bind to {addr}: {e}")))?;

    axum::serve(listener, router).await.map_err(|e| Error::ConfigFatal(format!("server error: {e}")))?;

    Ok(())
}
