//! Monitor endpoints: liveness, readiness and Prometheus metrics.

use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::metrics::encode_metrics;
use crate::provider::Provider;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub monitor: String,
    pub sessions: usize,
    pub unmuted: usize,
}

/// Shared state for the monitor endpoints.
#[derive(Clone)]
pub struct ServerState {
    pub monitor_name: String,
    pub provider: Arc<Provider>,
}

impl ServerState {
    pub fn new(monitor_name: impl Into<String>, provider: Arc<Provider>) -> Self {
        Self { monitor_name: monitor_name.into(), provider }
    }
}

/// Always 200 while the process is up.
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        monitor: state.monitor_name.clone(),
        sessions: state.provider.session_count(),
        unmuted: state.provider.unmuted_sessions(),
    })
}

/// 200 only while at least one session is unmuted.
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let unmuted = state.provider.unmuted_sessions();
    let status_code = if unmuted > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(HealthResponse {
            status: if unmuted > 0 { "ready" } else { "not_ready" }.to_string(),
            monitor: state.monitor_name.clone(),
            sessions: state.provider.session_count(),
            unmuted,
        }),
    )
}

/// Prometheus text exposition.
async fn metrics() -> Result<String, StatusCode> {
    encode_metrics().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn run_server(addr: SocketAddr, state: ServerState) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state)).await
}
