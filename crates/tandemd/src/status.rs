//! HTTP status endpoint: exposes the node's overlay view as JSON.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;

use tandem_net::{Networking, NodeStatus};

#[derive(Clone)]
pub struct StatusState {
    pub networking: Arc<Networking>,
}

// ── /status ──────────────────────────────────────────────────────────────────

async fn handle_status(State(state): State<StatusState>) -> Json<NodeStatus> {
    Json(state.networking.status().await)
}

// ── /health ──────────────────────────────────────────────────────────────────

async fn handle_health(State(state): State<StatusState>) -> StatusCode {
    if state.networking.is_closed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .with_state(state)
}

pub async fn serve(state: StatusState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
