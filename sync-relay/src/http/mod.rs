//! HTTP endpoints for sync-relay.
//!
//! Health, metrics, session CRUD, and the realtime channel upgrade.

pub mod health;
mod metrics;
mod sessions;
mod ws;

use crate::orchestrator::RelayOrchestrator;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
///
/// Session and channel routes come from `[server]` in the relay config.
pub fn build_router(relay: Arc<RelayOrchestrator>) -> Router {
    let server = &relay.config().server;
    let sessions_route = server.session_path.trim_end_matches('/').to_string();
    let session_route = format!("{}/:id", sessions_route);
    let channel_route = server.channel_path.clone();

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route(
            &sessions_route,
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route(
            &session_route,
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route(&channel_route, get(ws::channel_handler))
        .layer(Extension(relay))
}

/// Serve the router on an already-bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, relay: Arc<RelayOrchestrator>) -> crate::error::Result<()> {
    axum::serve(listener, build_router(relay)).await?;
    Ok(())
}
