//! Session CRUD endpoints.

use crate::orchestrator::RelayOrchestrator;
use crate::store::CreateSessionOptions;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use std::sync::Arc;
use sync_types::{CreateSessionRequest, SessionId};

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("session not found: {}", id) })),
    )
        .into_response()
}

/// `POST {session_path}`. The body is optional.
pub async fn create_session(
    Extension(relay): Extension<Arc<RelayOrchestrator>>,
    body: Option<Json<CreateSessionRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let options = CreateSessionOptions {
        id: request.id,
        metadata: request.metadata,
        conflict_resolution: None,
    };

    match relay.create_session(options).await {
        Ok(summary) => (StatusCode::CREATED, Json(summary)).into_response(),
        Err(e) => (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

/// `GET {session_path}`.
pub async fn list_sessions(Extension(relay): Extension<Arc<RelayOrchestrator>>) -> Response {
    Json(relay.list_sessions().await).into_response()
}

/// `GET {session_path}/:id`.
pub async fn get_session(
    Extension(relay): Extension<Arc<RelayOrchestrator>>,
    Path(id): Path<String>,
) -> Response {
    match relay.get_session(&SessionId::new(id.clone())).await {
        Some(summary) => Json(summary).into_response(),
        None => not_found(&id),
    }
}

/// `DELETE {session_path}/:id`. Closes the session's connections.
pub async fn delete_session(
    Extension(relay): Extension<Arc<RelayOrchestrator>>,
    Path(id): Path<String>,
) -> Response {
    if relay.delete_session(&SessionId::new(id.clone())).await {
        Json(json!({ "deleted": true, "id": id })).into_response()
    } else {
        not_found(&id)
    }
}
