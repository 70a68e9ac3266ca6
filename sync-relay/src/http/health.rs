//! Health check endpoint.

use crate::orchestrator::RelayOrchestrator;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Wire protocol version.
    pub protocol_version: String,
    /// Active sessions.
    pub sessions: usize,
    /// Live connections.
    pub connections: usize,
    /// Whether the expiry sweep is running.
    pub sweep_active: bool,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(
    Extension(relay): Extension<Arc<RelayOrchestrator>>,
) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);
    let stats = relay.get_stats().await;

    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: sync_types::PROTOCOL_VERSION.to_string(),
        sessions: stats.sessions,
        connections: stats.connections.total_connections,
        sweep_active: stats.lifecycle_active,
        uptime_seconds: uptime,
    })
}
