//! Relay orchestrator.
//!
//! Owns the session store, lifecycle sweep and connection registry; accepts
//! channels, routes protocol frames, and negotiates write authority.
//!
//! Lock order is always store, then registry. Every coordinated mutation
//! holds both, so a session and its connections change as one unit.

use crate::channel::{ChannelHandle, DuplexChannel};
use crate::config::{Config, ConflictResolution};
use crate::connection;
use crate::error::{ProtocolError, StoreError};
use crate::lifecycle::{SessionLifecycle, SharedStore};
use crate::limits::RateLimits;
use crate::registry::{Connection, ConnectionRegistry, RegistryStats};
use crate::store::{CreateSessionOptions, SessionEvent, SessionStore};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use sync_types::{
    close_code, ConnectionId, DirectionAssignment, Envelope, ErrorCode, Message, MessageType,
    PeerInfo, Role, RoleChange, SessionId, SessionSummary, SyncDirection, SyncError,
    TransferConfirmation, PROTOCOL_VERSION,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Channels accepted into a session.
    pub connections_total: AtomicU64,
    /// Channels refused (unknown session, full session, rate limit).
    pub connections_rejected: AtomicU64,
    /// Frames relayed verbatim to peers.
    pub frames_routed: AtomicU64,
    /// Grants of the `active` role.
    pub control_transfers: AtomicU64,
    /// `assign_sync_direction` frames sent.
    pub direction_assignments: AtomicU64,
    /// Sessions created.
    pub sessions_created: AtomicU64,
    /// Frames or upgrades refused by a rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Malformed or refused frames.
    pub errors_total: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot returned by [`RelayOrchestrator::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    /// Active sessions.
    pub sessions: usize,
    /// Connection counters.
    pub connections: RegistryStats,
    /// Whether the expiry sweep is running.
    pub lifecycle_active: bool,
}

/// Server-side coordinator.
pub struct RelayOrchestrator {
    config: Config,
    store: SharedStore,
    registry: Mutex<ConnectionRegistry>,
    lifecycle: SessionLifecycle,
    events: broadcast::Sender<SessionEvent>,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RelayOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayOrchestrator")
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl RelayOrchestrator {
    /// Create a stopped orchestrator.
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(256);
        let store = Arc::new(Mutex::new(SessionStore::new(
            config.sessions.ttl(),
            config.sessions.conflict_resolution,
            events.clone(),
        )));
        let lifecycle = SessionLifecycle::new(store.clone(), config.cleanup.interval(), events.clone());
        let rate_limits = RateLimits::new(&config.limits);

        Self {
            config,
            store,
            registry: Mutex::new(ConnectionRegistry::new()),
            lifecycle,
            events,
            rate_limits,
            metrics: RelayMetrics::default(),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// The lifecycle manager.
    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    /// Start the expiry sweep, health pings, and session event handling.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        if self.config.cleanup.enabled {
            self.lifecycle.start();
        } else {
            tracing::info!("Session sweep disabled");
        }
        tasks.push(self.spawn_event_task());
        tasks.push(self.spawn_ping_task());
        tracing::info!("Relay orchestrator started");
    }

    /// Stop background work and close every connection.
    pub async fn stop(&self) {
        self.abort_tasks();
        self.lifecycle.stop();

        let mut store = self.store.lock().await;
        let mut registry = self.registry.lock().await;
        for id in registry.connection_ids() {
            if let Some(conn) = registry.evict(&id, close_code::NORMAL, "relay shutting down") {
                store.update_client_count(&conn.session_id, 0);
                store.set_active_client(&conn.session_id, None);
            }
        }
        tracing::info!("Relay orchestrator stopped");
    }

    fn abort_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    /// Subscribe to session expiry and deletion.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ===========================================
    // Session management
    // ===========================================

    /// Create a session.
    pub async fn create_session(
        &self,
        options: CreateSessionOptions,
    ) -> Result<SessionSummary, StoreError> {
        let summary = self.store.lock().await.create(options)?;
        bump(&self.metrics.sessions_created);
        Ok(summary)
    }

    /// Public view of an active session.
    pub async fn get_session(&self, id: &SessionId) -> Option<SessionSummary> {
        self.store.lock().await.get(id)
    }

    /// All active sessions.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.store.lock().await.list()
    }

    /// Delete a session and close its connections with `1001`.
    pub async fn delete_session(&self, id: &SessionId) -> bool {
        let mut store = self.store.lock().await;
        if !store.delete(id) {
            return false;
        }
        let closed = self.registry.lock().await.close_all_connections(
            id,
            close_code::SESSION_ENDED,
            "session deleted",
        );
        tracing::info!("Session {} deleted, closed {} connections", id, closed);
        true
    }

    /// Relay counters.
    pub async fn get_stats(&self) -> RelayStats {
        let sessions = self.store.lock().await.active_count();
        let connections = self.registry.lock().await.get_stats();
        RelayStats {
            sessions,
            connections,
            lifecycle_active: self.lifecycle.is_active(),
        }
    }

    // ===========================================
    // Channels
    // ===========================================

    /// Attach a channel to a session.
    ///
    /// Refuses with close code `1008` if the session does not exist or is
    /// full. A live connection with the same client ID is superseded with
    /// `4000`. On success the per-connection task is spawned.
    pub async fn handle_upgrade(self: &Arc<Self>, session_id: SessionId, channel: DuplexChannel) -> bool {
        let DuplexChannel {
            handle,
            inbound,
            client_id,
        } = channel;

        if self.rate_limits.check_upgrade().is_err() {
            bump(&self.metrics.rate_limit_hits);
            return self.reject(&handle, &session_id, "too many connection attempts");
        }

        let mut store = self.store.lock().await;
        if store.get(&session_id).is_none() {
            return self.reject(&handle, &session_id, "session not found");
        }

        let mut registry = self.registry.lock().await;

        if let Some(client) = client_id.as_deref() {
            let previous = registry
                .find_connection_by_client_id(&session_id, client)
                .map(|c| c.id.clone());
            if let Some(previous) = previous {
                tracing::info!("Client {} reconnected, superseding {}", client, previous);
                registry.evict(&previous, close_code::SUPERSEDED, "superseded by a newer connection");
            }
        }

        if registry.get_connection_count(&session_id) >= self.config.sessions.max_connections_per_session {
            drop(registry);
            return self.reject(&handle, &session_id, "session full");
        }

        let connection = Connection::new(ConnectionId::random(), session_id.clone(), handle.clone(), client_id);
        let connection_id = connection.id.clone();
        let peer = PeerInfo {
            client_id: connection.display_id().to_string(),
            connection_id: connection_id.to_string(),
        };
        registry.add_connection(connection);
        store.update_activity(&session_id);

        let mut txn = SessionTxn {
            store: &mut store,
            registry: &mut registry,
            session_id: &session_id,
            metrics: &self.metrics,
        };
        txn.sync();
        txn.broadcast(&Message::ClientConnected(peer), Some(&connection_id));

        tracing::info!(
            "Connection {} joined session {} ({} connected)",
            connection_id,
            session_id,
            txn.registry.get_connection_count(&session_id)
        );
        drop(registry);
        drop(store);

        bump(&self.metrics.connections_total);
        tokio::spawn(connection::run(
            Arc::clone(self),
            connection_id,
            inbound,
            handle.closed_signal(),
        ));
        true
    }

    fn reject(&self, handle: &ChannelHandle, session_id: &SessionId, reason: &str) -> bool {
        tracing::warn!("Rejected channel for session {}: {}", session_id, reason);
        bump(&self.metrics.connections_rejected);
        handle.close(close_code::POLICY_VIOLATION, reason);
        false
    }

    /// Refresh a connection's liveness after a pong.
    pub async fn handle_pong(&self, id: &ConnectionId) {
        self.registry.lock().await.update_connection_activity(id);
    }

    /// Clean up after a channel closed.
    ///
    /// Clears the session's active holder if this connection held it; no
    /// other connection is promoted.
    pub async fn handle_close(&self, id: &ConnectionId) {
        let mut store = self.store.lock().await;
        let mut registry = self.registry.lock().await;

        let Some(connection) = registry.remove_connection(id) else {
            return;
        };
        let session_id = connection.session_id.clone();
        let mut txn = SessionTxn {
            store: &mut store,
            registry: &mut registry,
            session_id: &session_id,
            metrics: &self.metrics,
        };
        txn.sync();
        txn.broadcast(
            &Message::ClientDisconnected(PeerInfo {
                client_id: connection.display_id().to_string(),
                connection_id: id.to_string(),
            }),
            None,
        );

        tracing::info!(
            "Connection {} left session {} (was {:?})",
            id,
            session_id,
            connection.role
        );
    }

    /// Decode and route one inbound text frame.
    pub async fn handle_frame(&self, id: &ConnectionId, text: &str) {
        let envelope = match decode(text) {
            Ok(envelope) => envelope,
            Err(ProtocolError::Decode(SyncError::UnknownMessageType(kind))) => {
                tracing::warn!("Ignoring unknown message type '{}' from {}", kind, id);
                return;
            }
            Err(e) => {
                bump(&self.metrics.errors_total);
                tracing::warn!("Bad frame from {}: {}", id, e);
                self.reply_error(id, e.code(), &e.to_string()).await;
                return;
            }
        };

        if self.rate_limits.check_message(id).is_err() {
            bump(&self.metrics.rate_limit_hits);
            tracing::warn!("Rate limited frame from {}", id);
            self.reply_error(id, ErrorCode::ServerError, "rate limit exceeded")
                .await;
            return;
        }

        let mut store = self.store.lock().await;
        let mut registry = self.registry.lock().await;

        let Some(connection) = registry.get_connection_mut(id) else {
            return;
        };
        if connection.client_id.is_none() && !envelope.client_id.is_empty() {
            connection.client_id = Some(envelope.client_id.clone());
        }
        let session_id = connection.session_id.clone();
        if store.get(&session_id).is_none() {
            tracing::debug!("Dropping frame from {}: session {} ended", id, session_id);
            registry.evict(id, close_code::SESSION_ENDED, "session ended");
            return;
        }
        registry.update_connection_activity(id);
        store.update_activity(&session_id);

        let mut txn = SessionTxn {
            store: &mut store,
            registry: &mut registry,
            session_id: &session_id,
            metrics: &self.metrics,
        };
        txn.route(id, envelope.message, text);
    }

    async fn reply_error(&self, id: &ConnectionId, code: ErrorCode, message: &str) {
        let registry = self.registry.lock().await;
        if let Some(connection) = registry.get_connection(id) {
            send(&connection.channel, &Message::error(code, message));
        }
    }

    // ===========================================
    // Background tasks
    // ===========================================

    fn spawn_ping_task(self: &Arc<Self>) -> JoinHandle<()> {
        let relay = Arc::downgrade(self);
        let period = self.config.health.ping_interval();

        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(relay) = relay.upgrade() else { break };
                relay.ping_all().await;
            }
        })
    }

    async fn ping_all(&self) {
        let registry = self.registry.lock().await;
        let pinged = registry
            .connection_ids()
            .iter()
            .filter_map(|id| registry.get_connection(id))
            .filter(|c| c.channel.ping())
            .count();
        drop(registry);

        self.rate_limits.shrink();
        tracing::debug!("Pinged {} connections", pinged);
    }

    fn spawn_event_task(self: &Arc<Self>) -> JoinHandle<()> {
        let relay: Weak<Self> = Arc::downgrade(self);
        let mut events = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(relay) = relay.upgrade() else { break };
                        relay.on_session_event(event).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Session event task lagged by {} events", missed);
                        let Some(relay) = relay.upgrade() else { break };
                        relay.close_orphaned_connections().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Close connections whose session is no longer active.
    ///
    /// Covers events dropped by a lagging subscriber.
    async fn close_orphaned_connections(&self) -> usize {
        let store = self.store.lock().await;
        let mut registry = self.registry.lock().await;

        let mut closed = 0;
        for session_id in registry.session_ids() {
            if store.get(&session_id).is_some() {
                continue;
            }
            closed += registry.close_all_connections(
                &session_id,
                close_code::SESSION_ENDED,
                "session ended",
            );
        }
        if closed > 0 {
            tracing::info!("Closed {} connections of ended sessions", closed);
        }
        closed
    }

    async fn on_session_event(&self, event: SessionEvent) {
        let reason = match &event {
            SessionEvent::Expired(_) => "session expired",
            SessionEvent::Deleted(_) => "session deleted",
        };
        let closed = self.registry.lock().await.close_all_connections(
            event.session_id(),
            close_code::SESSION_ENDED,
            reason,
        );
        if closed > 0 {
            tracing::info!(
                "Closed {} connections of session {} ({})",
                closed,
                event.session_id(),
                reason
            );
        }
    }
}

impl Drop for RelayOrchestrator {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let envelope = Envelope::from_json(text)?;
    if !envelope.is_compatible() {
        return Err(ProtocolError::VersionMismatch {
            client: envelope.protocol_version,
            server: PROTOCOL_VERSION.to_string(),
        });
    }
    Ok(envelope)
}

fn send(channel: &ChannelHandle, message: &Message) -> bool {
    match Envelope::from_relay(message.clone()).to_json() {
        Ok(text) => channel.send_text(text),
        Err(e) => {
            tracing::error!("Failed to encode {}: {}", message.message_type(), e);
            false
        }
    }
}

/// One session's store record and connections, both locked.
struct SessionTxn<'a> {
    store: &'a mut SessionStore,
    registry: &'a mut ConnectionRegistry,
    session_id: &'a SessionId,
    metrics: &'a RelayMetrics,
}

impl SessionTxn<'_> {
    fn route(&mut self, sender: &ConnectionId, message: Message, raw: &str) {
        let kind = message.message_type();
        tracing::debug!("Routing {} from {}", kind, sender);

        match message {
            Message::RequestControl => self.request_control(sender),
            Message::AcceptControl(_) => {
                if self.role_of(sender) != Some(Role::Active) {
                    self.grant_active(sender, "control offer accepted");
                }
                self.relay(sender, raw);
            }
            Message::ReleaseControl => {
                if self.role_of(sender) == Some(Role::Active) {
                    self.registry.set_connection_role(sender, Role::Connected);
                    self.sync();
                }
                self.relay(sender, raw);
            }
            Message::RoleChanged(change) => self.role_claim(sender, change.role, raw),
            Message::CoordinateSyncDirection(request) => {
                self.coordinate(sender, request.preferred)
            }
            _ => self.relay(sender, raw),
        }
    }

    fn request_control(&mut self, sender: &ConnectionId) {
        let holder = self
            .registry
            .find_active_connection(self.session_id)
            .map(|c| c.id.clone());

        match holder {
            None => self.grant_active(sender, "control requested"),
            Some(holder) if &holder == sender => {
                self.send_to(sender, &self.confirmation(sender));
            }
            Some(holder) => match self.policy() {
                ConflictResolution::FirstComeFirstServed => {
                    tracing::info!("Denied control to {}: held by {}", sender, holder);
                    bump(&self.metrics.errors_total);
                    self.send_to(
                        sender,
                        &Message::refusal(
                            ErrorCode::InvalidOperation,
                            "control is held by another client",
                            MessageType::RequestControl,
                        ),
                    );
                }
                ConflictResolution::LatestRequestWins => {
                    self.grant_active(sender, "control requested");
                }
            },
        }
    }

    fn role_claim(&mut self, sender: &ConnectionId, role: Role, raw: &str) {
        let holder = self
            .registry
            .find_active_connection(self.session_id)
            .map(|c| c.id.clone());

        if role == Role::Active && holder.as_ref().is_some_and(|h| h != sender) {
            bump(&self.metrics.errors_total);
            self.send_to(
                sender,
                &Message::refusal(
                    ErrorCode::InvalidOperation,
                    "another client holds control",
                    MessageType::RoleChanged,
                ),
            );
            return;
        }

        self.registry.set_connection_role(sender, role);
        self.sync();
        self.relay(sender, raw);
    }

    /// Hand `active` to `winner`, demoting any other holder to `passive`.
    ///
    /// Demoted holders and bystanders receive `role_changed`; the winner
    /// receives `confirm_transfer`.
    fn grant_active(&mut self, winner: &ConnectionId, reason: &str) {
        let demoted: Vec<ConnectionId> = self
            .registry
            .get_session_connections(self.session_id)
            .into_iter()
            .filter(|c| c.role == Role::Active && &c.id != winner)
            .map(|c| c.id.clone())
            .collect();

        for loser in &demoted {
            self.registry.set_connection_role(loser, Role::Passive);
        }
        self.registry.set_connection_role(winner, Role::Active);
        self.sync();

        for loser in &demoted {
            let notice = Message::RoleChanged(RoleChange {
                client_id: self.display_id(loser),
                role: Role::Passive,
                reason: Some(reason.to_string()),
            });
            self.broadcast(&notice, None);
        }

        self.send_to(winner, &self.confirmation(winner));
        let notice = Message::RoleChanged(RoleChange {
            client_id: self.display_id(winner),
            role: Role::Active,
            reason: Some(reason.to_string()),
        });
        self.broadcast(&notice, Some(winner));

        bump(&self.metrics.control_transfers);
        tracing::info!("Granted control of {} to {}", self.session_id, winner);
    }

    /// Direction negotiation.
    ///
    /// The requester gets its preferred direction. With `ACTIVE`, every
    /// other connection becomes passive. With `PASSIVE`, exactly one other
    /// connection becomes active (the current holder, else the earliest
    /// connected) and the rest passive.
    fn coordinate(&mut self, sender: &ConnectionId, preferred: SyncDirection) {
        let others: Vec<(ConnectionId, Role)> = self
            .registry
            .get_session_connections(self.session_id)
            .into_iter()
            .filter(|c| &c.id != sender)
            .map(|c| (c.id.clone(), c.role))
            .collect();

        let mut plan = vec![(sender.clone(), preferred)];
        match preferred {
            SyncDirection::Active => {
                plan.extend(others.into_iter().map(|(id, _)| (id, SyncDirection::Passive)));
            }
            SyncDirection::Passive => {
                let promoted = others
                    .iter()
                    .find(|(_, role)| *role == Role::Active)
                    .or_else(|| others.first())
                    .map(|(id, _)| id.clone());
                plan.extend(others.into_iter().map(|(id, _)| {
                    let direction = if Some(&id) == promoted.as_ref() {
                        SyncDirection::Active
                    } else {
                        SyncDirection::Passive
                    };
                    (id, direction)
                }));
            }
        }

        // Demote before promoting so two actives never coexist.
        plan.sort_by_key(|(_, direction)| *direction == SyncDirection::Active);
        for (id, direction) in &plan {
            self.registry.set_connection_role(id, Role::from(*direction));
        }
        self.sync();

        for (id, direction) in plan {
            self.send_to(&id, &Message::AssignSyncDirection(DirectionAssignment { direction }));
            bump(&self.metrics.direction_assignments);
        }
        tracing::info!(
            "Coordinated directions in {}: {} prefers {:?}",
            self.session_id,
            sender,
            preferred
        );
    }

    fn policy(&self) -> ConflictResolution {
        self.store
            .get_internal(self.session_id)
            .map(|r| r.conflict_resolution)
            .unwrap_or_default()
    }

    fn role_of(&self, id: &ConnectionId) -> Option<Role> {
        self.registry.get_connection(id).map(|c| c.role)
    }

    fn display_id(&self, id: &ConnectionId) -> String {
        self.registry
            .get_connection(id)
            .map_or_else(|| id.to_string(), |c| c.display_id().to_string())
    }

    fn confirmation(&self, id: &ConnectionId) -> Message {
        Message::ConfirmTransfer(TransferConfirmation {
            role: Role::Active,
            active_client_id: Some(self.display_id(id)),
        })
    }

    /// Recompute the session's active holder and connection count from the
    /// registry.
    fn sync(&mut self) {
        let active = self
            .registry
            .find_active_connection(self.session_id)
            .map(|c| c.id.to_string());
        let count = self.registry.get_connection_count(self.session_id);
        self.store.set_active_client(self.session_id, active);
        self.store.update_client_count(self.session_id, count);
    }

    fn send_to(&self, id: &ConnectionId, message: &Message) {
        if let Some(connection) = self.registry.get_connection(id) {
            send(&connection.channel, message);
        }
    }

    fn broadcast(&self, message: &Message, except: Option<&ConnectionId>) {
        for connection in self.registry.get_session_connections(self.session_id) {
            if Some(&connection.id) != except {
                send(&connection.channel, message);
            }
        }
    }

    /// Forward the sender's frame verbatim to its session peers.
    fn relay(&self, sender: &ConnectionId, raw: &str) {
        let delivered = self
            .registry
            .get_session_connections(self.session_id)
            .into_iter()
            .filter(|c| &c.id != sender && c.channel.is_open())
            .filter(|c| c.channel.send_text(raw))
            .count();
        if delivered > 0 {
            bump(&self.metrics.frames_routed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelPeer, OutboundFrame};
    use serde_json::json;
    use std::time::Duration;
    use sync_types::{ControlOfferPayload, DirectionRequest};

    const WAIT: Duration = Duration::from_secs(2);

    fn relay_with(config: Config) -> Arc<RelayOrchestrator> {
        Arc::new(RelayOrchestrator::new(config))
    }

    fn relay() -> Arc<RelayOrchestrator> {
        relay_with(Config::default())
    }

    async fn session(relay: &RelayOrchestrator) -> SessionId {
        relay
            .create_session(CreateSessionOptions {
                metadata: Some(json!({ "tutorial": "t1" })),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    struct Peer {
        inner: ChannelPeer,
        client_id: String,
    }

    impl Peer {
        fn send(&self, message: Message) {
            let text = Envelope::new(message, self.client_id.clone())
                .to_json()
                .unwrap();
            assert!(self.inner.send_text(text));
        }

        async fn next_frame(&mut self) -> OutboundFrame {
            tokio::time::timeout(WAIT, self.inner.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel dropped")
        }

        /// Next relay message, skipping presence notices.
        async fn next(&mut self) -> Message {
            loop {
                match self.next_frame().await {
                    OutboundFrame::Text(text) => {
                        let message = Envelope::from_json(&text).unwrap().message;
                        if !matches!(
                            message,
                            Message::ClientConnected(_) | Message::ClientDisconnected(_)
                        ) {
                            return message;
                        }
                    }
                    OutboundFrame::Ping => continue,
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        }

        async fn expect_close(&mut self) -> u16 {
            loop {
                if let OutboundFrame::Close { code, .. } = self.next_frame().await {
                    return code;
                }
            }
        }

        fn assert_quiet(&mut self) {
            while let Ok(frame) = self.inner.outbound.try_recv() {
                if let OutboundFrame::Text(text) = &frame {
                    let message = Envelope::from_json(text).unwrap().message;
                    assert!(
                        matches!(
                            message,
                            Message::ClientConnected(_) | Message::ClientDisconnected(_)
                        ),
                        "unexpected {message:?}"
                    );
                }
            }
        }
    }

    async fn join(relay: &Arc<RelayOrchestrator>, session: &SessionId, client: &str) -> Peer {
        let (channel, peer) = DuplexChannel::pair(Some(client.to_string()));
        assert!(relay.handle_upgrade(session.clone(), channel).await);
        Peer {
            inner: peer,
            client_id: client.to_string(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn roles(relay: &RelayOrchestrator, session: &SessionId) -> Vec<(String, Role)> {
        let registry = relay.registry.lock().await;
        registry
            .get_session_connections(session)
            .into_iter()
            .map(|c| (c.display_id().to_string(), c.role))
            .collect()
    }

    async fn role_of(relay: &RelayOrchestrator, session: &SessionId, client: &str) -> Role {
        roles(relay, session)
            .await
            .into_iter()
            .find(|(id, _)| id == client)
            .map(|(_, role)| role)
            .unwrap()
    }

    /// The session's activeClientId is set iff some connection is active,
    /// and at most one connection is active.
    async fn assert_single_writer(relay: &RelayOrchestrator, session: &SessionId) {
        let store = relay.store.lock().await;
        let registry = relay.registry.lock().await;
        let actives: Vec<&Connection> = registry
            .get_session_connections(session)
            .into_iter()
            .filter(|c| c.role == Role::Active)
            .collect();
        assert!(actives.len() <= 1, "two actives in {session}");
        let recorded = store
            .get_internal(session)
            .and_then(|r| r.active_client_id.clone());
        assert_eq!(recorded, actives.first().map(|c| c.id.to_string()));
    }

    // ===========================================
    // Sessions and upgrades
    // ===========================================

    #[tokio::test]
    async fn upgrade_to_unknown_session_is_refused() {
        let relay = relay();
        let (channel, mut peer) = DuplexChannel::pair(None);

        assert!(!relay.handle_upgrade(SessionId::new("missing"), channel).await);
        assert_eq!(
            peer.recv().await,
            Some(OutboundFrame::Close {
                code: close_code::POLICY_VIOLATION,
                reason: "session not found".into()
            })
        );
        assert_eq!(relay.metrics().connections_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn upgrade_updates_client_count_and_announces() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "desktop").await;
        let _b = join(&relay, &sid, "web").await;

        assert_eq!(relay.get_session(&sid).await.unwrap().client_count, 2);
        match a.next_frame().await {
            OutboundFrame::Text(text) => {
                let message = Envelope::from_json(&text).unwrap().message;
                assert!(matches!(message, Message::ClientConnected(p) if p.client_id == "web"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_session_is_refused() {
        let mut config = Config::default();
        config.sessions.max_connections_per_session = 1;
        let relay = relay_with(config);
        let sid = session(&relay).await;
        let _a = join(&relay, &sid, "a").await;

        let (channel, mut peer) = DuplexChannel::pair(Some("b".into()));
        assert!(!relay.handle_upgrade(sid.clone(), channel).await);
        assert!(matches!(
            peer.recv().await,
            Some(OutboundFrame::Close { code: close_code::POLICY_VIOLATION, .. })
        ));
    }

    #[tokio::test]
    async fn same_client_id_supersedes() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut old = join(&relay, &sid, "desktop").await;
        let _new = join(&relay, &sid, "desktop").await;

        assert_eq!(old.expect_close().await, close_code::SUPERSEDED);
        settle().await;
        assert_eq!(relay.get_session(&sid).await.unwrap().client_count, 1);
    }

    #[tokio::test]
    async fn delete_session_closes_connections_and_blocks_upgrades() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        assert!(relay.delete_session(&sid).await);
        assert!(!relay.delete_session(&sid).await);
        assert_eq!(a.expect_close().await, close_code::SESSION_ENDED);
        assert_eq!(b.expect_close().await, close_code::SESSION_ENDED);

        let (channel, _peer) = DuplexChannel::pair(None);
        assert!(!relay.handle_upgrade(sid.clone(), channel).await);
        assert!(relay.get_session(&sid).await.is_none());
    }

    #[tokio::test]
    async fn expiry_closes_connections() {
        let mut config = Config::default();
        config.sessions.ttl_secs = 0;
        let relay = relay_with(config);
        relay.start();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(relay.lifecycle().cleanup_expired_sessions().await, 1);
        assert_eq!(a.expect_close().await, close_code::SESSION_ENDED);

        let (channel, _peer) = DuplexChannel::pair(None);
        assert!(!relay.handle_upgrade(sid, channel).await);
        relay.stop().await;
    }

    #[tokio::test]
    async fn mass_expiry_closes_every_connection() {
        let mut config = Config::default();
        config.sessions.ttl_secs = 0;
        config.limits.upgrades_per_second = 10_000;
        let relay = relay_with(config);
        relay.start();

        // More sessions than the event channel holds.
        let mut peers = Vec::new();
        for _ in 0..400 {
            let sid = session(&relay).await;
            peers.push(join(&relay, &sid, "desktop").await);
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(relay.lifecycle().cleanup_expired_sessions().await, 400);
        for peer in &mut peers {
            assert_eq!(peer.expect_close().await, close_code::SESSION_ENDED);
        }
        settle().await;
        assert_eq!(relay.get_stats().await.connections.total_connections, 0);
        assert_eq!(relay.lifecycle().expired_total(), 400);
        relay.stop().await;
    }

    #[tokio::test]
    async fn frames_for_ended_session_are_dropped() {
        let mut config = Config::default();
        config.sessions.ttl_secs = 0;
        let relay = relay_with(config);
        // No event task: nothing closes the connections on expiry.
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(relay.lifecycle().cleanup_expired_sessions().await, 1);

        a.send(Message::StateUpdate(json!({"step": 1})));
        assert_eq!(a.expect_close().await, close_code::SESSION_ENDED);
        settle().await;
        while let Ok(frame) = b.inner.outbound.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                let message = Envelope::from_json(&text).unwrap().message;
                assert!(!matches!(message, Message::StateUpdate(_)), "state leaked");
            }
        }
    }

    // ===========================================
    // Routing
    // ===========================================

    #[tokio::test]
    async fn state_update_reaches_session_peers_only() {
        let relay = relay();
        let s1 = session(&relay).await;
        let s2 = session(&relay).await;
        let a = join(&relay, &s1, "a").await;
        let mut b = join(&relay, &s1, "b").await;
        let mut outsider = join(&relay, &s2, "c").await;

        a.send(Message::StateUpdate(json!({ "step": 2 })));
        assert_eq!(b.next().await, Message::StateUpdate(json!({ "step": 2 })));

        settle().await;
        outsider.assert_quiet();
    }

    #[tokio::test]
    async fn unknown_type_is_ignored() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.inner
            .send_text(r#"{"type":"teleport","clientId":"a","data":{}}"#);
        settle().await;
        a.assert_quiet();
        b.assert_quiet();
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_channel_survives() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.inner.send_text("{not json");
        match a.next().await {
            Message::Error(e) => assert_eq!(e.code, ErrorCode::InvalidMessage),
            other => panic!("unexpected {other:?}"),
        }

        a.send(Message::RequestSync);
        assert_eq!(b.next().await, Message::RequestSync);
    }

    #[tokio::test]
    async fn incompatible_version_is_reported() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;

        a.inner.send_text(
            r#"{"type":"request_sync","clientId":"a","data":{},"timestamp":1,"protocol_version":"2.0"}"#,
        );
        match a.next().await {
            Message::Error(e) => assert_eq!(e.code, ErrorCode::ProtocolVersion),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limited_frames_are_refused() {
        let mut config = Config::default();
        config.limits.messages_per_minute = 1;
        let relay = relay_with(config);
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(Message::RequestSync);
        a.send(Message::RequestSync);
        assert_eq!(b.next().await, Message::RequestSync);
        match a.next().await {
            Message::Error(e) => assert_eq!(e.code, ErrorCode::ServerError),
            other => panic!("unexpected {other:?}"),
        }
        settle().await;
        b.assert_quiet();
    }

    // ===========================================
    // Control
    // ===========================================

    #[tokio::test]
    async fn request_control_grants_when_free() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(Message::RequestControl);
        match a.next().await {
            Message::ConfirmTransfer(c) => {
                assert_eq!(c.role, Role::Active);
                assert_eq!(c.active_client_id.as_deref(), Some("a"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match b.next().await {
            Message::RoleChanged(r) => assert_eq!((r.client_id.as_str(), r.role), ("a", Role::Active)),
            other => panic!("unexpected {other:?}"),
        }
        assert_single_writer(&relay, &sid).await;

        // Holder asking again is confirmed idempotently.
        a.send(Message::RequestControl);
        assert!(matches!(a.next().await, Message::ConfirmTransfer(_)));
        assert_single_writer(&relay, &sid).await;
    }

    #[tokio::test]
    async fn first_come_first_served_denies_transfer() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(Message::RequestControl);
        a.next().await;
        b.next().await;

        b.send(Message::RequestControl);
        match b.next().await {
            Message::Error(e) => {
                assert_eq!(e.code, ErrorCode::InvalidOperation);
                assert_eq!(e.in_reply_to, Some(MessageType::RequestControl));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(role_of(&relay, &sid, "a").await, Role::Active);
        assert_single_writer(&relay, &sid).await;
    }

    #[tokio::test]
    async fn latest_request_wins_flips_roles() {
        let relay = relay();
        let sid = relay
            .create_session(CreateSessionOptions {
                conflict_resolution: Some(ConflictResolution::LatestRequestWins),
                ..Default::default()
            })
            .await
            .unwrap()
            .id;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(Message::RequestControl);
        a.next().await;
        b.next().await;

        b.send(Message::RequestControl);
        match a.next().await {
            Message::RoleChanged(r) => assert_eq!((r.client_id.as_str(), r.role), ("a", Role::Passive)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(b.next().await, Message::RoleChanged(_) | Message::ConfirmTransfer(_)));
        assert_eq!(role_of(&relay, &sid, "b").await, Role::Active);
        assert_eq!(role_of(&relay, &sid, "a").await, Role::Passive);
        assert_single_writer(&relay, &sid).await;
    }

    #[tokio::test]
    async fn offer_is_relayed_and_accept_flips_roles() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(Message::RequestControl);
        a.next().await;
        b.next().await;

        let offer = ControlOfferPayload { offer_id: "o1".into() };
        a.send(Message::OfferControl(offer.clone()));
        assert_eq!(b.next().await, Message::OfferControl(offer));

        b.send(Message::AcceptControl(sync_types::ControlAnswer { offer_id: "o1".into() }));
        // The demotion notice reaches everyone before the winner's confirmation.
        loop {
            if let Message::ConfirmTransfer(c) = b.next().await {
                assert_eq!(c.active_client_id.as_deref(), Some("b"));
                break;
            }
        }

        let mut saw_demotion = false;
        let mut saw_accept = false;
        while !(saw_demotion && saw_accept) {
            match a.next().await {
                Message::RoleChanged(r) if r.client_id == "a" => {
                    assert_eq!(r.role, Role::Passive);
                    saw_demotion = true;
                }
                Message::AcceptControl(_) => saw_accept = true,
                _ => {}
            }
        }
        assert_eq!(role_of(&relay, &sid, "b").await, Role::Active);
        assert_single_writer(&relay, &sid).await;
    }

    #[tokio::test]
    async fn release_clears_active_and_is_relayed() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(Message::RequestControl);
        a.next().await;
        b.next().await;

        a.send(Message::ReleaseControl);
        assert_eq!(b.next().await, Message::ReleaseControl);
        assert_eq!(role_of(&relay, &sid, "a").await, Role::Connected);
        assert!(relay.get_session(&sid).await.unwrap().active_client_id.is_none());
    }

    #[tokio::test]
    async fn conflicting_active_claim_is_refused() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(Message::RequestControl);
        a.next().await;
        b.next().await;

        b.send(Message::RoleChanged(RoleChange {
            client_id: "b".into(),
            role: Role::Active,
            reason: None,
        }));
        match b.next().await {
            Message::Error(e) => assert_eq!(e.in_reply_to, Some(MessageType::RoleChanged)),
            other => panic!("unexpected {other:?}"),
        }
        settle().await;
        a.assert_quiet();
        assert_single_writer(&relay, &sid).await;
    }

    #[tokio::test]
    async fn passive_claim_is_relayed() {
        let relay = relay();
        let sid = session(&relay).await;
        let a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        let change = RoleChange {
            client_id: "a".into(),
            role: Role::Passive,
            reason: None,
        };
        a.send(Message::RoleChanged(change.clone()));
        assert_eq!(b.next().await, Message::RoleChanged(change));
        assert_eq!(role_of(&relay, &sid, "a").await, Role::Passive);
    }

    // ===========================================
    // Direction coordination
    // ===========================================

    fn coordinate(direction: SyncDirection) -> Message {
        Message::CoordinateSyncDirection(DirectionRequest { preferred: direction })
    }

    fn assignment(direction: SyncDirection) -> Message {
        Message::AssignSyncDirection(DirectionAssignment { direction })
    }

    #[tokio::test]
    async fn lone_connection_gets_preferred_direction() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;

        a.send(coordinate(SyncDirection::Active));
        assert_eq!(a.next().await, assignment(SyncDirection::Active));
        settle().await;
        a.assert_quiet();
        assert!(relay.get_session(&sid).await.unwrap().active_client_id.is_some());
        assert_single_writer(&relay, &sid).await;
    }

    #[tokio::test]
    async fn active_then_passive_converges() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(coordinate(SyncDirection::Active));
        assert_eq!(a.next().await, assignment(SyncDirection::Active));
        assert_eq!(b.next().await, assignment(SyncDirection::Passive));

        b.send(coordinate(SyncDirection::Passive));
        assert_eq!(b.next().await, assignment(SyncDirection::Passive));
        assert_eq!(a.next().await, assignment(SyncDirection::Active));

        assert_eq!(roles(&relay, &sid).await.len(), 2);
        assert_eq!(role_of(&relay, &sid, "a").await, Role::Active);
        assert_eq!(role_of(&relay, &sid, "b").await, Role::Passive);
        assert_single_writer(&relay, &sid).await;
    }

    #[tokio::test]
    async fn passive_first_promotes_peer() {
        let relay = relay();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        b.send(coordinate(SyncDirection::Passive));
        assert_eq!(b.next().await, assignment(SyncDirection::Passive));
        assert_eq!(a.next().await, assignment(SyncDirection::Active));
        assert_eq!(role_of(&relay, &sid, "a").await, Role::Active);
        assert_single_writer(&relay, &sid).await;
    }

    #[tokio::test]
    async fn three_way_passive_request_keeps_single_writer() {
        let relay = relay();
        let sid = session(&relay).await;
        let _a = join(&relay, &sid, "a").await;
        let b = join(&relay, &sid, "b").await;
        let c = join(&relay, &sid, "c").await;

        b.send(coordinate(SyncDirection::Active));
        settle().await;
        c.send(coordinate(SyncDirection::Passive));
        settle().await;

        // b already held control, so it keeps it.
        assert_eq!(role_of(&relay, &sid, "b").await, Role::Active);
        assert_eq!(role_of(&relay, &sid, "a").await, Role::Passive);
        assert_eq!(role_of(&relay, &sid, "c").await, Role::Passive);
        assert_single_writer(&relay, &sid).await;
    }

    // ===========================================
    // Disconnects and health
    // ===========================================

    #[tokio::test]
    async fn active_disconnect_clears_holder_without_promotion() {
        let relay = relay();
        let sid = session(&relay).await;
        let a = join(&relay, &sid, "a").await;
        let mut b = join(&relay, &sid, "b").await;

        a.send(coordinate(SyncDirection::Active));
        assert_eq!(b.next().await, assignment(SyncDirection::Passive));

        a.inner.close();
        loop {
            if let OutboundFrame::Text(text) = b.next_frame().await {
                if let Message::ClientDisconnected(p) = Envelope::from_json(&text).unwrap().message {
                    assert_eq!(p.client_id, "a");
                    break;
                }
            }
        }

        let summary = relay.get_session(&sid).await.unwrap();
        assert!(summary.active_client_id.is_none());
        assert_eq!(summary.client_count, 1);
        assert_eq!(role_of(&relay, &sid, "b").await, Role::Passive);
    }

    #[tokio::test]
    async fn ping_and_pong() {
        let mut config = Config::default();
        config.health.ping_interval_secs = 1;
        let relay = relay_with(config);
        relay.start();
        let sid = session(&relay).await;
        let mut a = join(&relay, &sid, "a").await;

        let frame = tokio::time::timeout(Duration::from_secs(3), a.inner.recv())
            .await
            .unwrap();
        assert_eq!(frame, Some(OutboundFrame::Ping));
        a.inner.send_pong();
        settle().await;

        let stats = relay.get_stats().await;
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.connections.total_connections, 1);
        assert!(stats.lifecycle_active);
        relay.stop().await;
        assert!(!relay.lifecycle().is_active());
    }
}
