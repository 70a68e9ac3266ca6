//! Public session shape shared by the relay's HTTP surface and clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SessionId;

/// Lifecycle status of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting connections.
    Active,
    /// Swept by the lifecycle manager.
    Expired,
    /// Explicitly deleted.
    Deleted,
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Creation time, epoch ms.
    pub created_at: u64,
    /// Expiry time, epoch ms.
    pub expires_at: u64,
    /// Number of live connections.
    pub client_count: usize,
    /// Last inbound activity, epoch ms.
    pub last_activity: u64,
    /// Caller-supplied metadata.
    pub metadata: Value,
    /// Connection currently holding write authority.
    pub active_client_id: Option<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
}

/// Body of `POST /sessions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Arbitrary caller metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Explicit session ID; random when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SessionId>,
}

/// WebSocket close codes used by the relay.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The session was deleted or expired.
    pub const SESSION_ENDED: u16 = 1001;
    /// Session not found or full.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Replaced by a newer connection with the same client ID.
    pub const SUPERSEDED: u16 = 4000;

    /// Whether a client should stop reconnecting after this code.
    pub fn is_terminal(code: u16) -> bool {
        matches!(code, SESSION_ENDED | POLICY_VIOLATION | SUPERSEDED)
    }
}
