//! In-memory session registry.
//!
//! The store knows nothing about connections. Expiry and deletion are
//! announced on an injected broadcast channel so the orchestrator can
//! force-close the affected connections.

use crate::config::ConflictResolution;
use crate::error::StoreError;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use sync_types::{now_ms, SessionId, SessionStatus, SessionSummary};
use tokio::sync::broadcast;

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The lifecycle sweep expired the session.
    Expired(SessionId),
    /// The session was explicitly deleted.
    Deleted(SessionId),
}

impl SessionEvent {
    /// The affected session.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Expired(id) | Self::Deleted(id) => id,
        }
    }
}

/// Options for [`SessionStore::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Explicit ID; random when `None`.
    pub id: Option<SessionId>,
    /// Caller metadata; `null` when `None`.
    pub metadata: Option<Value>,
    /// Per-session policy override.
    pub conflict_resolution: Option<ConflictResolution>,
}

/// Raw session record, including non-active ones.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Session identifier.
    pub id: SessionId,
    /// Creation time, epoch ms.
    pub created_at: u64,
    /// Expiry time, epoch ms.
    pub expires_at: u64,
    /// Last inbound activity, epoch ms.
    pub last_activity: u64,
    /// Caller metadata.
    pub metadata: Value,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Connection currently holding write authority.
    pub active_client_id: Option<String>,
    /// Live connection count, maintained by the orchestrator.
    pub client_count: usize,
    /// Policy for contested control requests.
    pub conflict_resolution: ConflictResolution,
}

impl SessionRecord {
    /// Whether the record accepts connections.
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Public view of this record.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            client_count: self.client_count,
            last_activity: self.last_activity,
            metadata: self.metadata.clone(),
            active_client_id: self.active_client_id.clone(),
            status: self.status,
        }
    }
}

/// Session registry with expiry metadata.
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<SessionId, SessionRecord>,
    ttl: Duration,
    conflict_resolution: ConflictResolution,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    /// Create a store with the given defaults, publishing on `events`.
    pub fn new(
        ttl: Duration,
        conflict_resolution: ConflictResolution,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
            conflict_resolution,
            events,
        }
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    /// Create a session.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateSession`] if an active session already has
    /// the requested ID. A non-active record with that ID is replaced.
    pub fn create(&mut self, options: CreateSessionOptions) -> Result<SessionSummary, StoreError> {
        let id = options.id.unwrap_or_else(SessionId::random);
        if self.sessions.get(&id).is_some_and(SessionRecord::is_active) {
            return Err(StoreError::DuplicateSession(id));
        }

        let now = now_ms();
        let record = SessionRecord {
            id: id.clone(),
            created_at: now,
            expires_at: now.saturating_add(self.ttl_ms()),
            last_activity: now,
            metadata: options.metadata.unwrap_or(Value::Null),
            status: SessionStatus::Active,
            active_client_id: None,
            client_count: 0,
            conflict_resolution: options
                .conflict_resolution
                .unwrap_or(self.conflict_resolution),
        };
        let summary = record.summary();
        self.sessions.insert(id.clone(), record);

        tracing::info!("Created session {}", id);
        Ok(summary)
    }

    /// Public view of an active session.
    pub fn get(&self, id: &SessionId) -> Option<SessionSummary> {
        self.sessions
            .get(id)
            .filter(|r| r.is_active())
            .map(SessionRecord::summary)
    }

    /// Raw record regardless of status.
    pub fn get_internal(&self, id: &SessionId) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    /// Record inbound activity and slide the expiry window forward.
    pub fn update_activity(&mut self, id: &SessionId) -> bool {
        let ttl = self.ttl_ms();
        match self.sessions.get_mut(id).filter(|r| r.is_active()) {
            Some(record) => {
                let now = now_ms();
                record.last_activity = now;
                record.expires_at = now.saturating_add(ttl);
                true
            }
            None => false,
        }
    }

    /// Delete a session and announce it.
    pub fn delete(&mut self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some(mut record) if record.is_active() => {
                record.status = SessionStatus::Deleted;
                let _ = self.events.send(SessionEvent::Deleted(id.clone()));
                tracing::info!("Deleted session {}", id);
                true
            }
            Some(record) => {
                // Already expired: finish the purge quietly.
                tracing::debug!("Removed {:?} session {}", record.status, id);
                false
            }
            None => false,
        }
    }

    /// Public views of every active session.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .values()
            .filter(|r| r.is_active())
            .map(SessionRecord::summary)
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Active sessions whose expiry time has passed.
    pub fn get_expired_sessions(&self) -> Vec<SessionId> {
        self.expired_as_of(now_ms())
    }

    fn expired_as_of(&self, now: u64) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|r| r.is_active() && now > r.expires_at)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Mark an active session expired and announce it.
    pub fn mark_expired(&mut self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id).filter(|r| r.is_active()) {
            Some(record) => {
                record.status = SessionStatus::Expired;
                record.active_client_id = None;
                let _ = self.events.send(SessionEvent::Expired(id.clone()));
                tracing::info!("Session {} expired", id);
                true
            }
            None => false,
        }
    }

    /// Drop records marked expired by an earlier sweep.
    pub fn purge_expired(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, r| r.status != SessionStatus::Expired);
        before - self.sessions.len()
    }

    /// Set or clear the write-authority holder.
    pub fn set_active_client(&mut self, id: &SessionId, connection: Option<String>) -> bool {
        match self.sessions.get_mut(id).filter(|r| r.is_active()) {
            Some(record) => {
                record.active_client_id = connection;
                true
            }
            None => false,
        }
    }

    /// Record the live connection count.
    pub fn update_client_count(&mut self, id: &SessionId, count: usize) -> bool {
        match self.sessions.get_mut(id) {
            Some(record) => {
                record.client_count = count;
                true
            }
            None => false,
        }
    }

    /// Number of active sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|r| r.is_active()).count()
    }
}
