//! Live connection bookkeeping.
//!
//! Connections are held in a primary map keyed by connection ID plus a
//! per-session index. Every mutation keeps both in step.

use crate::channel::ChannelHandle;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use sync_types::{close_code, now_ms, ConnectionId, Role, SessionId};

/// One client's live channel attached to a session.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Relay-assigned ID.
    pub id: ConnectionId,
    /// Owning session.
    pub session_id: SessionId,
    /// Sending half of the channel.
    pub channel: ChannelHandle,
    /// Caller-chosen client ID.
    pub client_id: Option<String>,
    /// Epoch ms.
    pub connected_at: u64,
    /// Epoch ms of the last pong.
    pub last_ping: u64,
    /// Current write-authority role.
    pub role: Role,
    /// Epoch ms of the last role change.
    pub last_role_change: u64,
}

impl Connection {
    /// A fresh `connected` connection.
    pub fn new(
        id: ConnectionId,
        session_id: SessionId,
        channel: ChannelHandle,
        client_id: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            session_id,
            channel,
            client_id,
            connected_at: now,
            last_ping: now,
            role: Role::Connected,
            last_role_change: now,
        }
    }

    /// Client ID when known, otherwise the connection ID.
    pub fn display_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Live connections.
    pub total_connections: usize,
    /// Sessions with at least one connection.
    pub sessions: usize,
    /// Connections holding `active`.
    pub active: usize,
    /// Connections holding `passive`.
    pub passive: usize,
    /// Connections with no direction.
    pub connected: usize,
}

/// Connections grouped by session.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    by_session: HashMap<SessionId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its session.
    ///
    /// Returns false, leaving the registry untouched, if the ID is taken.
    pub fn add_connection(&mut self, connection: Connection) -> bool {
        if self.connections.contains_key(&connection.id) {
            return false;
        }
        self.by_session
            .entry(connection.session_id.clone())
            .or_default()
            .insert(connection.id.clone());
        self.connections.insert(connection.id.clone(), connection);
        true
    }

    /// Remove a connection, closing its channel with `1000` if still open.
    pub fn remove_connection(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.evict(id, close_code::NORMAL, "connection removed")
    }

    /// Remove a connection, closing its channel with the given code.
    pub fn evict(&mut self, id: &ConnectionId, code: u16, reason: &str) -> Option<Connection> {
        let connection = self.connections.remove(id)?;

        if let Some(ids) = self.by_session.get_mut(&connection.session_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_session.remove(&connection.session_id);
            }
        }

        connection.channel.close(code, reason);
        tracing::debug!(
            "Removed connection {} from session {} (remaining: {})",
            id,
            connection.session_id,
            self.get_connection_count(&connection.session_id)
        );
        Some(connection)
    }

    /// Look up a connection.
    pub fn get_connection(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Look up a connection mutably.
    pub fn get_connection_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Connections of a session, oldest first.
    pub fn get_session_connections(&self, session_id: &SessionId) -> Vec<&Connection> {
        let mut connections: Vec<&Connection> = self
            .by_session
            .get(session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
            .collect();
        connections.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        connections
    }

    /// Refresh `last_ping`.
    pub fn update_connection_activity(&mut self, id: &ConnectionId) -> bool {
        match self.connections.get_mut(id) {
            Some(connection) => {
                connection.last_ping = now_ms();
                true
            }
            None => false,
        }
    }

    /// Set a connection's role. Returns the previous role.
    pub fn set_connection_role(&mut self, id: &ConnectionId, role: Role) -> Option<Role> {
        let connection = self.connections.get_mut(id)?;
        let previous = connection.role;
        if previous != role {
            connection.role = role;
            connection.last_role_change = now_ms();
        }
        Some(previous)
    }

    /// The connection holding `active` in a session.
    pub fn find_active_connection(&self, session_id: &SessionId) -> Option<&Connection> {
        self.get_session_connections(session_id)
            .into_iter()
            .find(|c| c.role == Role::Active)
    }

    /// The connection in a session with the given client ID.
    pub fn find_connection_by_client_id(
        &self,
        session_id: &SessionId,
        client_id: &str,
    ) -> Option<&Connection> {
        self.get_session_connections(session_id)
            .into_iter()
            .find(|c| c.client_id.as_deref() == Some(client_id))
    }

    /// Number of connections in a session.
    pub fn get_connection_count(&self, session_id: &SessionId) -> usize {
        self.by_session.get(session_id).map_or(0, HashSet::len)
    }

    /// Close and remove every connection of a session.
    pub fn close_all_connections(
        &mut self,
        session_id: &SessionId,
        code: u16,
        reason: &str,
    ) -> usize {
        let ids: Vec<ConnectionId> = self
            .by_session
            .get(session_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        ids.iter()
            .filter(|id| self.evict(id, code, reason).is_some())
            .count()
    }

    /// Sessions with at least one connection.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.by_session.keys().cloned().collect()
    }

    /// All connection IDs, for health pings.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    /// Registry counters.
    pub fn get_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_connections: self.connections.len(),
            sessions: self.by_session.len(),
            ..Default::default()
        };
        for connection in self.connections.values() {
            match connection.role {
                Role::Active => stats.active += 1,
                Role::Passive => stats.passive += 1,
                Role::Connected => stats.connected += 1,
            }
        }
        stats
    }

    #[cfg(test)]
    fn index_is_consistent(&self) -> bool {
        let indexed: usize = self.by_session.values().map(HashSet::len).sum();
        indexed == self.connections.len()
            && self.by_session.iter().all(|(session, ids)| {
                !ids.is_empty()
                    && ids.iter().all(|id| {
                        self.connections
                            .get(id)
                            .is_some_and(|c| &c.session_id == session)
                    })
            })
    }
}
