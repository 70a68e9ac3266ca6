//! SyncClient - the main interface for tutor-sync.
//!
//! This module provides [`SyncClient`], the facade applications use to share
//! tutorial state with peers through a relay session.
//!
//! # Architecture
//!
//! SyncClient keeps the pure phase machine (from sync-core) behind one lock
//! and drives the connection manager and dispatcher from it. Local calls and
//! inbound frames are both processed to completion under that lock, so a
//! phase check and the frame it guards never interleave with other updates.
//!
//! ```text
//! Application → SyncClient → ConnectionManager → Transport → Relay
//!                   ↓               ↓
//!              PhaseMachine   ClientEvent stream
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tutor_sync_client::{ClientConfig, SyncClient, WsTransport};
//!
//! let config = ClientConfig::new("http://127.0.0.1:8080").with_client_id("desktop");
//! let (client, mut events) = SyncClient::new(config, WsTransport::new());
//!
//! let session = client.create_session(Some(json!({"tutorial": "t1"}))).await?;
//! client.connect(&session.id).await?;
//! client.push_state_to_peer().await?;
//! // wait for ClientEvent::PhaseChanged { to: SyncPhase::Active, .. }
//! client.send_tutorial_state(json!({"step": 2})).await?;
//! ```

use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionStatus};
use crate::dispatcher::{MessageDispatcher, MessageHandler};
use crate::error::ClientError;
use crate::transport::Transport;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use sync_core::{Operation, PhaseError, PhaseEvent, PhaseMachine, SyncPhase, Transition};
use sync_types::{
    ControlAnswer, ControlOfferPayload, CreateSessionRequest, DirectionAssignment, Envelope,
    ErrorCode, ErrorPayload, Message, MessageType, PeerInfo, Role, RoleChange, SessionId,
    SessionSummary, SyncDirection, TransferConfirmation,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Everything a [`SyncClient`] reports to the application, in order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The sync phase changed.
    PhaseChanged {
        /// Previous phase.
        from: SyncPhase,
        /// New phase.
        to: SyncPhase,
    },
    /// The connection status changed.
    StatusChanged(ConnectionStatus),
    /// The active peer published tutorial state.
    TutorialStateReceived {
        /// Sender's client ID.
        from: String,
        /// The state.
        state: Value,
    },
    /// A peer asked for the current state.
    SyncRequested {
        /// Requesting client ID.
        from: String,
    },
    /// A peer offered write authority.
    ControlOffered(ControlOffer),
    /// A peer accepted one of our offers.
    ControlOfferAccepted {
        /// Accepting client ID.
        by: String,
        /// The offer.
        offer_id: String,
    },
    /// A peer declined one of our offers.
    ControlOfferDeclined {
        /// Declining client ID.
        by: String,
        /// The offer.
        offer_id: String,
    },
    /// A pending offer became unreachable when the channel closed. Treat it
    /// as declined.
    ControlOfferWithdrawn {
        /// Offering client ID.
        from: String,
        /// The offer.
        offer_id: String,
    },
    /// The relay confirmed this client holds write authority.
    ControlGained {
        /// Display ID the relay recorded as active.
        active_client_id: Option<String>,
    },
    /// Write authority moved to another client.
    ControlLost {
        /// Relay-supplied reason, if any.
        reason: Option<String>,
    },
    /// The relay refused a control request or role claim.
    ControlDenied {
        /// Relay message.
        message: String,
    },
    /// A peer gave up write authority.
    ControlReleased {
        /// Releasing client ID.
        by: String,
    },
    /// Another connection's role changed.
    PeerRoleChanged(RoleChange),
    /// A peer joined the session.
    PeerConnected(PeerInfo),
    /// A peer left the session.
    PeerDisconnected(PeerInfo),
    /// The channel closed.
    Disconnected {
        /// Close code, if the relay sent one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
        /// Whether a reconnect will be attempted.
        will_reconnect: bool,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// The channel reopened after a drop.
    Reconnected,
    /// A non-fatal error.
    Error {
        /// Taxonomy code.
        code: ErrorCode,
        /// Details.
        message: String,
    },
}

/// Answers a control offer on behalf of a client.
#[async_trait]
pub trait OfferResponder: Send + Sync {
    /// Accept (`true`) or decline (`false`) `offer_id`.
    async fn respond(&self, offer_id: &str, accept: bool) -> Result<(), ClientError>;
}

/// A control offer received while passive.
///
/// Accepting sends `accept_control` and moves the client to
/// [`SyncPhase::Active`] as one step.
#[derive(Clone)]
pub struct ControlOffer {
    offer_id: String,
    from: String,
    responder: Arc<dyn OfferResponder>,
}

impl std::fmt::Debug for ControlOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlOffer")
            .field("offer_id", &self.offer_id)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl ControlOffer {
    /// The offer ID.
    pub fn offer_id(&self) -> &str {
        &self.offer_id
    }

    /// The offering client's ID.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Take write authority.
    pub async fn accept(&self) -> Result<(), ClientError> {
        self.responder.respond(&self.offer_id, true).await
    }

    /// Turn the offer down.
    pub async fn decline(&self) -> Result<(), ClientError> {
        self.responder.respond(&self.offer_id, false).await
    }
}

#[derive(Debug, Default)]
struct ClientState {
    machine: PhaseMachine,
    session_id: Option<SessionId>,
    /// offer ID -> offering client ID
    pending_offers: HashMap<String, String>,
    /// Bumped whenever a direction request is settled or abandoned.
    direction_generation: u64,
    /// Frames that arrived before `connect()` finished.
    held: Vec<Envelope>,
}

struct Shared<T: Transport> {
    config: ClientConfig,
    connection: Arc<ConnectionManager<T>>,
    dispatcher: MessageDispatcher,
    http: reqwest::Client,
    state: Mutex<ClientState>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl<T: Transport> Shared<T> {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn apply(
        &self,
        state: &mut ClientState,
        event: PhaseEvent,
    ) -> Result<Transition, PhaseError> {
        let transition = state.machine.on_event(event)?;
        if transition.changed() {
            tracing::debug!("Phase {} -> {}", transition.from, transition.to);
            self.emit(ClientEvent::PhaseChanged {
                from: transition.from,
                to: transition.to,
            });
        }
        Ok(transition)
    }

    fn apply_logged(&self, state: &mut ClientState, event: PhaseEvent) -> Option<Transition> {
        match self.apply(state, event) {
            Ok(transition) => Some(transition),
            Err(e) => {
                tracing::warn!("Ignoring {:?}: {}", event, e);
                None
            }
        }
    }

    fn withdraw_offers(&self, state: &mut ClientState) {
        for (offer_id, from) in state.pending_offers.drain() {
            tracing::debug!("Offer {} from {} withdrawn", offer_id, from);
            self.emit(ClientEvent::ControlOfferWithdrawn { from, offer_id });
        }
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.connection
            .send(&self.dispatcher.envelope(message))
            .await
    }

    async fn respond(&self, offer_id: &str, accept: bool) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        if !state.pending_offers.contains_key(offer_id) {
            return Err(ClientError::OfferNotPending(offer_id.to_string()));
        }
        state.machine.check(Operation::RespondToOffer)?;

        self.connection
            .send(&self.dispatcher.answer(offer_id, accept))
            .await?;
        if accept {
            self.apply(&mut state, PhaseEvent::ControlGained)?;
            self.connection
                .flash_status(ConnectionStatus::TakenBackControl);
        }
        state.pending_offers.remove(offer_id);

        tracing::info!(
            "{} control offer {}",
            if accept { "Accepted" } else { "Declined" },
            offer_id
        );
        Ok(())
    }

    async fn direction_timed_out(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.direction_generation != generation || !state.machine.phase().is_initializing() {
            return;
        }
        tracing::warn!("No direction assignment arrived; back to idle");
        self.apply_logged(&mut state, PhaseEvent::DirectionTimedOut);
        self.emit(ClientEvent::Error {
            code: ErrorCode::Timeout,
            message: "no sync direction assignment from relay".into(),
        });
    }

    /// Apply one inbound frame, or hold it while still connecting.
    fn dispatch(self: &Arc<Self>, state: &mut ClientState, envelope: Envelope) {
        if state.machine.phase() == SyncPhase::Connecting {
            tracing::debug!("Holding {} until connected", envelope.message_type());
            state.held.push(envelope);
            return;
        }
        let mut inbound = Inbound {
            shared: self,
            state,
        };
        self.dispatcher.dispatch(envelope, &mut inbound);
    }

    fn replay_held(self: &Arc<Self>, state: &mut ClientState) {
        for envelope in std::mem::take(&mut state.held) {
            self.dispatch(state, envelope);
        }
    }

    async fn on_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StatusChanged(status) => self.emit(ClientEvent::StatusChanged(status)),
            ConnectionEvent::Message(envelope) => {
                let mut state = self.state.lock().await;
                self.dispatch(&mut state, envelope);
            }
            ConnectionEvent::Error { code, message } => {
                self.emit(ClientEvent::Error { code, message })
            }
            ConnectionEvent::Closed {
                code,
                reason,
                will_reconnect,
            } => {
                let mut state = self.state.lock().await;
                self.withdraw_offers(&mut state);
                state.direction_generation += 1;
                self.apply_logged(&mut state, PhaseEvent::Disconnected);
                if will_reconnect {
                    self.apply_logged(&mut state, PhaseEvent::ConnectRequested);
                }
                self.emit(ClientEvent::Disconnected {
                    code,
                    reason,
                    will_reconnect,
                });
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                self.emit(ClientEvent::Reconnecting { attempt, delay })
            }
            ConnectionEvent::Reconnected => {
                let mut state = self.state.lock().await;
                self.apply_logged(&mut state, PhaseEvent::ConnectSucceeded);
                self.replay_held(&mut state);
                self.emit(ClientEvent::Reconnected);
            }
            ConnectionEvent::MaxReconnectAttemptsExceeded => {
                let mut state = self.state.lock().await;
                self.apply_logged(&mut state, PhaseEvent::Disconnected);
            }
        }
    }
}

struct Responder<T: Transport> {
    shared: Weak<Shared<T>>,
}

#[async_trait]
impl<T: Transport> OfferResponder for Responder<T> {
    async fn respond(&self, offer_id: &str, accept: bool) -> Result<(), ClientError> {
        match self.shared.upgrade() {
            Some(shared) => shared.respond(offer_id, accept).await,
            None => Err(ClientError::NotConnected),
        }
    }
}

/// Applies one inbound frame under the state lock.
struct Inbound<'a, T: Transport> {
    shared: &'a Arc<Shared<T>>,
    state: &'a mut ClientState,
}

impl<T: Transport> Inbound<'_, T> {
    fn phase(&self) -> SyncPhase {
        self.state.machine.phase()
    }

    fn gain_control(&mut self, active_client_id: Option<String>) {
        if let Some(transition) = self.shared.apply_logged(self.state, PhaseEvent::ControlGained) {
            if transition.changed() {
                self.shared
                    .connection
                    .flash_status(ConnectionStatus::TakenBackControl);
            }
            self.shared
                .emit(ClientEvent::ControlGained { active_client_id });
        }
    }

    fn lose_control(&mut self, reason: Option<String>) {
        if self.phase() != SyncPhase::Active {
            return;
        }
        if self
            .shared
            .apply_logged(self.state, PhaseEvent::ControlLost)
            .is_some()
        {
            self.shared
                .connection
                .flash_status(ConnectionStatus::GivenAwayControl);
            self.shared.emit(ClientEvent::ControlLost { reason });
        }
    }
}

impl<T: Transport> MessageHandler for Inbound<'_, T> {
    fn on_state_update(&mut self, from: &str, state: Value) {
        if self.phase() == SyncPhase::Active {
            tracing::debug!("Dropping state from {} while active", from);
            return;
        }
        self.shared.emit(ClientEvent::TutorialStateReceived {
            from: from.to_string(),
            state,
        });
    }

    fn on_request_sync(&mut self, from: &str) {
        self.shared.emit(ClientEvent::SyncRequested {
            from: from.to_string(),
        });
    }

    fn on_offer_control(&mut self, from: &str, offer: ControlOfferPayload) {
        if self.phase() != SyncPhase::Passive {
            tracing::debug!("Ignoring offer {} while {}", offer.offer_id, self.phase());
            return;
        }
        self.state
            .pending_offers
            .insert(offer.offer_id.clone(), from.to_string());
        self.shared.emit(ClientEvent::ControlOffered(ControlOffer {
            offer_id: offer.offer_id,
            from: from.to_string(),
            responder: Arc::new(Responder {
                shared: Arc::downgrade(self.shared),
            }),
        }));
    }

    fn on_accept_control(&mut self, from: &str, answer: ControlAnswer) {
        self.shared.emit(ClientEvent::ControlOfferAccepted {
            by: from.to_string(),
            offer_id: answer.offer_id,
        });
    }

    fn on_decline_control(&mut self, from: &str, answer: ControlAnswer) {
        self.shared.emit(ClientEvent::ControlOfferDeclined {
            by: from.to_string(),
            offer_id: answer.offer_id,
        });
    }

    fn on_release_control(&mut self, from: &str) {
        self.shared.emit(ClientEvent::ControlReleased {
            by: from.to_string(),
        });
    }

    fn on_confirm_transfer(&mut self, _from: &str, confirmation: TransferConfirmation) {
        match confirmation.role {
            Role::Active => self.gain_control(confirmation.active_client_id),
            Role::Passive => self.lose_control(None),
            Role::Connected => {}
        }
    }

    fn on_role_changed(&mut self, _from: &str, change: RoleChange) {
        if change.client_id != self.shared.dispatcher.client_id() {
            self.shared.emit(ClientEvent::PeerRoleChanged(change));
        } else if change.role == Role::Passive {
            self.lose_control(change.reason);
        }
    }

    fn on_client_connected(&mut self, _from: &str, peer: PeerInfo) {
        self.shared.emit(ClientEvent::PeerConnected(peer));
    }

    fn on_client_disconnected(&mut self, _from: &str, peer: PeerInfo) {
        self.shared.emit(ClientEvent::PeerDisconnected(peer));
    }

    fn on_error(&mut self, _from: &str, error: ErrorPayload) {
        match error.in_reply_to {
            Some(MessageType::RequestControl | MessageType::RoleChanged) => {
                tracing::info!("Control denied: {}", error.message);
                self.shared.emit(ClientEvent::ControlDenied {
                    message: error.message,
                });
            }
            _ => {
                tracing::warn!("Relay error {}: {}", error.code, error.message);
                self.shared.emit(ClientEvent::Error {
                    code: error.code,
                    message: error.message,
                });
            }
        }
    }

    fn on_assign_sync_direction(&mut self, _from: &str, assignment: DirectionAssignment) {
        let direction = assignment.direction;
        if self.phase() == SyncPhase::ConnectedIdle {
            // A peer's request paired us before we chose.
            self.shared
                .apply_logged(self.state, PhaseEvent::DirectionRequested(direction));
        }
        self.state.direction_generation += 1;
        self.shared
            .apply_logged(self.state, PhaseEvent::DirectionAssigned(direction));
    }
}

/// Main client for tutor-sync.
///
/// Generic over the transport so tests can drive it with
/// [`MockTransport`](crate::MockTransport).
pub struct SyncClient<T: Transport> {
    shared: Arc<Shared<T>>,
    pump: JoinHandle<()>,
}

impl<T: Transport> std::fmt::Debug for SyncClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("client_id", &self.shared.dispatcher.client_id())
            .field("status", &self.shared.connection.status())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Drop for SyncClient<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl<T: Transport> SyncClient<T> {
    /// Create a disconnected client and the receiver for its events.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: ClientConfig,
        transport: T,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (connection, connection_events) = ConnectionManager::new(transport, config.clone());
        let (events, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            dispatcher: MessageDispatcher::new(config.client_id.as_str()),
            config,
            connection,
            http: reqwest::Client::new(),
            state: Mutex::new(ClientState::default()),
            events,
        });
        let pump = tokio::spawn(pump(Arc::clone(&shared), connection_events));

        (Self { shared, pump }, rx)
    }

    /// The configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// This client's ID.
    pub fn client_id(&self) -> &str {
        self.shared.dispatcher.client_id()
    }

    /// The current sync phase.
    pub async fn phase(&self) -> SyncPhase {
        self.shared.state.lock().await.machine.phase()
    }

    /// The connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.connection.status()
    }

    /// Whether the channel is open.
    pub fn is_connected(&self) -> bool {
        self.shared.connection.is_connected()
    }

    /// Session of the current or last connection.
    pub async fn session_id(&self) -> Option<SessionId> {
        self.shared.state.lock().await.session_id.clone()
    }

    /// Create a session on the relay.
    pub async fn create_session(
        &self,
        metadata: Option<Value>,
    ) -> Result<SessionSummary, ClientError> {
        let request = CreateSessionRequest { metadata, id: None };
        let response = self
            .shared
            .http
            .post(self.shared.config.session_url())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Server {
                status: status.as_u16(),
                message,
            });
        }
        let summary: SessionSummary = response.json().await?;
        tracing::info!("Created session {}", summary.id);
        Ok(summary)
    }

    /// Look up a session on the relay. `None` if it does not exist.
    pub async fn get_session(&self, id: &SessionId) -> Result<Option<SessionSummary>, ClientError> {
        let url = format!("{}/{}", self.shared.config.session_url(), id);
        let response = self.shared.http.get(url).send().await?;

        match response.status() {
            reqwest::StatusCode::OK => Ok(Some(response.json().await?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(ClientError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Join `session`.
    ///
    /// Ends in [`SyncPhase::ConnectedIdle`] on success and
    /// [`SyncPhase::Disconnected`] on failure.
    pub async fn connect(&self, session: &SessionId) -> Result<(), ClientError> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock().await;
            if state.machine.phase() == SyncPhase::Connecting {
                return Err(ClientError::ConnectionFailed(
                    "a connection attempt is already in flight".into(),
                ));
            }
            shared.apply(&mut state, PhaseEvent::ConnectRequested)?;
            state.session_id = Some(session.clone());
        }

        let result = shared.connection.connect(session).await;

        let mut state = shared.state.lock().await;
        match result {
            Ok(()) => {
                shared.apply(&mut state, PhaseEvent::ConnectSucceeded)?;
                shared.replay_held(&mut state);
                Ok(())
            }
            Err(e) => {
                state.held.clear();
                shared.apply_logged(&mut state, PhaseEvent::ConnectFailed);
                Err(e)
            }
        }
    }

    /// Leave the session. Idempotent; pending offers are withdrawn.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        shared.connection.disconnect().await;

        let mut state = shared.state.lock().await;
        shared.withdraw_offers(&mut state);
        state.direction_generation += 1;
        state.held.clear();
        let changed = shared
            .apply_logged(&mut state, PhaseEvent::Disconnected)
            .is_some_and(|t| t.changed());
        if changed {
            shared.emit(ClientEvent::Disconnected {
                code: None,
                reason: "disconnected by client".into(),
                will_reconnect: false,
            });
        }
    }

    /// Ask to become the publisher. Settles on an `assign_sync_direction`.
    pub async fn push_state_to_peer(&self) -> Result<(), ClientError> {
        self.request_direction(SyncDirection::Active).await
    }

    /// Ask to follow a peer. Settles on an `assign_sync_direction`.
    pub async fn pull_state_from_peer(&self) -> Result<(), ClientError> {
        self.request_direction(SyncDirection::Passive).await
    }

    async fn request_direction(&self, direction: SyncDirection) -> Result<(), ClientError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;

        if state.machine.phase() == SyncPhase::for_direction(direction) {
            return Ok(());
        }
        state.machine.check(Operation::ChooseDirection)?;

        shared
            .connection
            .send(&shared.dispatcher.coordinate(direction))
            .await?;
        shared.apply(&mut state, PhaseEvent::DirectionRequested(direction))?;
        state.direction_generation += 1;

        if let Some(timeout) = shared.config.direction_timeout {
            let generation = state.direction_generation;
            let weak = Arc::downgrade(shared);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(shared) = weak.upgrade() {
                    shared.direction_timed_out(generation).await;
                }
            });
        }
        Ok(())
    }

    /// Publish tutorial state to every peer. Only while active.
    pub async fn send_tutorial_state(&self, state: Value) -> Result<(), ClientError> {
        let guard = self.shared.state.lock().await;
        guard.machine.check(Operation::SendState)?;
        self.shared
            .connection
            .send(&self.shared.dispatcher.state_update(state))
            .await
    }

    /// Ask the active peer to publish its state.
    pub async fn request_state(&self) -> Result<(), ClientError> {
        let state = self.shared.state.lock().await;
        state.machine.check(Operation::RequestState)?;
        self.shared.send(Message::RequestSync).await
    }

    /// Offer write authority to peers. Returns the offer ID.
    pub async fn offer_control(&self) -> Result<String, ClientError> {
        let state = self.shared.state.lock().await;
        state.machine.check(Operation::OfferControl)?;

        let offer_id = uuid::Uuid::new_v4().to_string();
        self.shared
            .connection
            .send(&self.shared.dispatcher.offer(&offer_id))
            .await?;
        tracing::info!("Offered control ({})", offer_id);
        Ok(offer_id)
    }

    /// Ask the relay for write authority.
    ///
    /// The outcome arrives as [`ClientEvent::ControlGained`] or
    /// [`ClientEvent::ControlDenied`].
    pub async fn request_control(&self) -> Result<(), ClientError> {
        let state = self.shared.state.lock().await;
        state.machine.check(Operation::RequestControl)?;
        self.shared.send(Message::RequestControl).await
    }

    /// Give up write authority and become passive.
    pub async fn release_control(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        state.machine.check(Operation::ReleaseControl)?;

        shared.send(Message::ReleaseControl).await?;
        shared.apply(&mut state, PhaseEvent::ControlLost)?;
        shared
            .connection
            .flash_status(ConnectionStatus::GivenAwayControl);
        Ok(())
    }
}

async fn pump<T: Transport>(
    shared: Arc<Shared<T>>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        shared.on_connection_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;
    use sync_types::{close_code, Envelope};

    const WAIT: Duration = Duration::from_secs(2);

    fn test_config() -> ClientConfig {
        ClientConfig::new("http://relay.test")
            .with_client_id("me")
            .with_reconnect_delay(Duration::from_millis(10))
            .with_connection_timeout(Duration::from_millis(200))
    }

    fn client_with(
        config: ClientConfig,
    ) -> (
        MockTransport,
        SyncClient<MockTransport>,
        mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let transport = MockTransport::new();
        let (client, events) = SyncClient::new(config, transport.clone());
        (transport, client, events)
    }

    async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, mut pred: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("client dropped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_for_phase(events: &mut mpsc::UnboundedReceiver<ClientEvent>, phase: SyncPhase) {
        wait_for(events, |e| matches!(e, ClientEvent::PhaseChanged { to, .. } if *to == phase)).await;
    }

    fn relay(message: Message) -> Envelope {
        Envelope::from_relay(message)
    }

    fn assign(direction: SyncDirection) -> Envelope {
        relay(Message::AssignSyncDirection(DirectionAssignment { direction }))
    }

    /// Connect and settle in `direction`.
    async fn settled(
        direction: SyncDirection,
    ) -> (
        MockTransport,
        SyncClient<MockTransport>,
        mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let (transport, client, mut events) = client_with(test_config());
        client.connect(&SessionId::new("s1")).await.unwrap();
        transport.push_envelope(&assign(direction));
        wait_for_phase(&mut events, SyncPhase::for_direction(direction)).await;
        (transport, client, events)
    }

    // ===========================================
    // Connection
    // ===========================================

    #[tokio::test]
    async fn connect_reaches_connected_idle() {
        let (transport, client, mut events) = client_with(test_config());
        assert_eq!(client.phase().await, SyncPhase::Disconnected);

        client.connect(&SessionId::new("s1")).await.unwrap();

        assert_eq!(client.phase().await, SyncPhase::ConnectedIdle);
        assert_eq!(client.session_id().await, Some(SessionId::new("s1")));
        assert_eq!(
            transport.connected_url().as_deref(),
            Some("ws://relay.test/ws?session=s1&clientId=me")
        );
        wait_for_phase(&mut events, SyncPhase::Connecting).await;
        wait_for_phase(&mut events, SyncPhase::ConnectedIdle).await;
    }

    #[tokio::test]
    async fn connect_failure_returns_to_disconnected() {
        let (transport, client, _events) = client_with(test_config());
        transport.fail_next_connect();

        let err = client.connect(&SessionId::new("s1")).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
        assert_eq!(client.phase().await, SyncPhase::Disconnected);
    }

    #[tokio::test]
    async fn connect_twice_is_invalid_transition() {
        let (_transport, client, _events) = client_with(test_config());
        client.connect(&SessionId::new("s1")).await.unwrap();

        let err = client.connect(&SessionId::new("s1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(client.phase().await, SyncPhase::ConnectedIdle);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (_transport, client, _events) = client_with(test_config());
        client.disconnect().await;

        client.connect(&SessionId::new("s1")).await.unwrap();
        client.disconnect().await;
        client.disconnect().await;

        assert_eq!(client.phase().await, SyncPhase::Disconnected);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_reports_one_clean_close() {
        let (_transport, client, mut events) = client_with(test_config());
        client.connect(&SessionId::new("s1")).await.unwrap();
        client.disconnect().await;
        client.disconnect().await;

        match wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
            ClientEvent::Disconnected { will_reconnect, .. } => assert!(!will_reconnect),
            _ => unreachable!(),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, ClientEvent::Disconnected { .. } | ClientEvent::Error { .. }),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejoin_right_after_disconnect_is_clean() {
        let (_transport, client, mut events) = client_with(test_config());

        for _ in 0..20 {
            client.connect(&SessionId::new("s1")).await.unwrap();
            client.disconnect().await;
        }
        client.connect(&SessionId::new("s1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            match event {
                ClientEvent::Error { code, .. } => panic!("unexpected error {code:?}"),
                ClientEvent::Disconnected { will_reconnect, .. } => assert!(!will_reconnect),
                ClientEvent::Reconnecting { .. } => panic!("unexpected reconnect"),
                _ => {}
            }
        }
        assert_eq!(client.phase().await, SyncPhase::ConnectedIdle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn assignment_arriving_with_the_connect_is_adopted() {
        let (transport, client, mut events) = client_with(test_config());
        transport.push_on_connect(&assign(SyncDirection::Active));

        client.connect(&SessionId::new("s1")).await.unwrap();

        wait_for_phase(&mut events, SyncPhase::Active).await;
        assert_eq!(client.phase().await, SyncPhase::Active);
    }

    #[tokio::test]
    async fn unexpected_drop_reconnects_to_idle() {
        let (transport, client, mut events) = settled(SyncDirection::Passive).await;

        transport.drop_connection(1006, "abnormal");

        match wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await {
            ClientEvent::Disconnected { will_reconnect, .. } => assert!(will_reconnect),
            _ => unreachable!(),
        }
        wait_for(&mut events, |e| matches!(e, ClientEvent::Reconnected)).await;
        assert_eq!(client.phase().await, SyncPhase::ConnectedIdle);
        assert_eq!(transport.connect_count(), 2);
    }

    // ===========================================
    // Phase-gated operations
    // ===========================================

    #[tokio::test]
    async fn operations_outside_their_phase_never_reach_the_network() {
        let (transport, client, _events) = client_with(test_config());

        let err = client.push_state_to_peer().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperation);

        client.connect(&SessionId::new("s1")).await.unwrap();

        for result in [
            client.send_tutorial_state(json!({"step": 1})).await,
            client.request_state().await,
            client.request_control().await,
            client.release_control().await,
            client.offer_control().await.map(|_| ()),
        ] {
            assert_eq!(result.unwrap_err().code(), ErrorCode::InvalidOperation);
        }
        assert!(transport.sent_messages().is_empty());
        assert_eq!(client.phase().await, SyncPhase::ConnectedIdle);
    }

    #[tokio::test]
    async fn passive_client_cannot_send_state() {
        let (transport, client, _events) = settled(SyncDirection::Passive).await;

        let err = client
            .send_tutorial_state(json!({"step": 3}))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidOperation);
        assert!(transport.sent_messages().is_empty());
    }

    // ===========================================
    // Direction negotiation
    // ===========================================

    #[tokio::test]
    async fn push_state_waits_for_assignment() {
        let (transport, client, mut events) = client_with(test_config());
        client.connect(&SessionId::new("s1")).await.unwrap();

        client.push_state_to_peer().await.unwrap();
        assert_eq!(client.phase().await, SyncPhase::InitializingPush);
        assert_eq!(
            transport.sent_envelopes()[0].message,
            Message::CoordinateSyncDirection(sync_types::DirectionRequest {
                preferred: SyncDirection::Active
            })
        );

        transport.push_envelope(&assign(SyncDirection::Active));
        wait_for_phase(&mut events, SyncPhase::Active).await;

        client.send_tutorial_state(json!({"step": 2})).await.unwrap();
        assert_eq!(
            transport.sent_envelopes()[1].message,
            Message::StateUpdate(json!({"step": 2}))
        );
    }

    #[tokio::test]
    async fn unsolicited_assignment_is_adopted() {
        let (transport, client, mut events) = client_with(test_config());
        client.connect(&SessionId::new("s1")).await.unwrap();

        transport.push_envelope(&assign(SyncDirection::Passive));

        wait_for_phase(&mut events, SyncPhase::InitializingPull).await;
        wait_for_phase(&mut events, SyncPhase::Passive).await;
        assert_eq!(client.phase().await, SyncPhase::Passive);
    }

    #[tokio::test]
    async fn repeated_direction_request_is_idempotent() {
        let (transport, client, _events) = settled(SyncDirection::Active).await;

        client.push_state_to_peer().await.unwrap();
        assert!(transport.sent_messages().is_empty());

        let err = client.pull_state_from_peer().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperation);
    }

    #[tokio::test]
    async fn missing_assignment_times_out_to_idle() {
        let config = test_config().with_direction_timeout(Some(Duration::from_millis(50)));
        let (_transport, client, mut events) = client_with(config);
        client.connect(&SessionId::new("s1")).await.unwrap();

        client.pull_state_from_peer().await.unwrap();
        assert_eq!(client.phase().await, SyncPhase::InitializingPull);

        let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Error { .. })).await;
        assert!(matches!(
            event,
            ClientEvent::Error {
                code: ErrorCode::Timeout,
                ..
            }
        ));
        assert_eq!(client.phase().await, SyncPhase::ConnectedIdle);
    }

    #[tokio::test]
    async fn timely_assignment_cancels_timeout() {
        let config = test_config().with_direction_timeout(Some(Duration::from_millis(50)));
        let (transport, client, mut events) = client_with(config);
        client.connect(&SessionId::new("s1")).await.unwrap();

        client.pull_state_from_peer().await.unwrap();
        transport.push_envelope(&assign(SyncDirection::Passive));
        wait_for_phase(&mut events, SyncPhase::Passive).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.phase().await, SyncPhase::Passive);
    }

    // ===========================================
    // State routing
    // ===========================================

    #[tokio::test]
    async fn passive_client_receives_state() {
        let (transport, _client, mut events) = settled(SyncDirection::Passive).await;

        transport.push_envelope(&Envelope::new(
            Message::StateUpdate(json!({"step": 2})),
            "web",
        ));

        match wait_for(&mut events, |e| {
            matches!(e, ClientEvent::TutorialStateReceived { .. })
        })
        .await
        {
            ClientEvent::TutorialStateReceived { from, state } => {
                assert_eq!(from, "web");
                assert_eq!(state, json!({"step": 2}));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn active_client_drops_inbound_state() {
        let (transport, _client, mut events) = settled(SyncDirection::Active).await;

        transport.push_envelope(&Envelope::new(Message::StateUpdate(json!(1)), "web"));
        transport.push_envelope(&Envelope::new(Message::RequestSync, "web"));

        let event = wait_for(&mut events, |e| {
            matches!(
                e,
                ClientEvent::TutorialStateReceived { .. } | ClientEvent::SyncRequested { .. }
            )
        })
        .await;
        assert!(matches!(event, ClientEvent::SyncRequested { .. }));
    }

    // ===========================================
    // Control transfer
    // ===========================================

    fn offer_from(peer: &str, offer_id: &str) -> Envelope {
        Envelope::new(
            Message::OfferControl(ControlOfferPayload {
                offer_id: offer_id.into(),
            }),
            peer,
        )
    }

    async fn next_offer(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ControlOffer {
        match wait_for(events, |e| matches!(e, ClientEvent::ControlOffered(_))).await {
            ClientEvent::ControlOffered(offer) => offer,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn accepting_offer_sends_and_flips_phase_together() {
        let (transport, client, mut events) = settled(SyncDirection::Passive).await;

        transport.push_envelope(&offer_from("web", "o1"));
        let offer = next_offer(&mut events).await;
        assert_eq!(offer.offer_id(), "o1");
        assert_eq!(offer.from(), "web");

        offer.accept().await.unwrap();

        assert_eq!(client.phase().await, SyncPhase::Active);
        assert_eq!(
            transport.sent_envelopes().last().map(|e| e.message.clone()),
            Some(Message::AcceptControl(ControlAnswer {
                offer_id: "o1".into()
            }))
        );

        let again = offer.accept().await.unwrap_err();
        assert!(matches!(again, ClientError::OfferNotPending(_)));
    }

    #[tokio::test]
    async fn declining_offer_stays_passive() {
        let (transport, client, mut events) = settled(SyncDirection::Passive).await;

        transport.push_envelope(&offer_from("web", "o2"));
        next_offer(&mut events).await.decline().await.unwrap();

        assert_eq!(client.phase().await, SyncPhase::Passive);
        assert_eq!(
            transport.sent_envelopes()[0].message_type(),
            MessageType::DeclineControl
        );
    }

    #[tokio::test]
    async fn failed_accept_leaves_offer_pending() {
        let (transport, client, mut events) = settled(SyncDirection::Passive).await;

        transport.push_envelope(&offer_from("web", "o3"));
        let offer = next_offer(&mut events).await;
        transport.fail_next_send("buffer full");

        assert!(offer.accept().await.is_err());
        assert_eq!(client.phase().await, SyncPhase::Passive);

        offer.accept().await.unwrap();
        assert_eq!(client.phase().await, SyncPhase::Active);
    }

    #[tokio::test]
    async fn close_withdraws_pending_offers() {
        let (transport, client, mut events) = settled(SyncDirection::Passive).await;

        transport.push_envelope(&offer_from("web", "o4"));
        let offer = next_offer(&mut events).await;

        transport.drop_connection(close_code::SESSION_ENDED, "session deleted");

        match wait_for(&mut events, |e| {
            matches!(e, ClientEvent::ControlOfferWithdrawn { .. })
        })
        .await
        {
            ClientEvent::ControlOfferWithdrawn { from, offer_id } => {
                assert_eq!(from, "web");
                assert_eq!(offer_id, "o4");
            }
            _ => unreachable!(),
        }
        wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
        assert_eq!(client.phase().await, SyncPhase::Disconnected);
        assert!(matches!(
            offer.accept().await,
            Err(ClientError::OfferNotPending(_))
        ));
    }

    #[tokio::test]
    async fn offer_control_from_active() {
        let (transport, client, _events) = settled(SyncDirection::Active).await;

        let offer_id = client.offer_control().await.unwrap();

        assert_eq!(
            transport.sent_envelopes()[0].message,
            Message::OfferControl(ControlOfferPayload { offer_id })
        );
        assert_eq!(client.phase().await, SyncPhase::Active);
    }

    #[tokio::test]
    async fn request_control_granted() {
        let (transport, client, mut events) = settled(SyncDirection::Passive).await;

        client.request_control().await.unwrap();
        assert_eq!(
            transport.sent_envelopes()[0].message,
            Message::RequestControl
        );

        transport.push_envelope(&relay(Message::ConfirmTransfer(TransferConfirmation {
            role: Role::Active,
            active_client_id: Some("me".into()),
        })));

        match wait_for(&mut events, |e| matches!(e, ClientEvent::ControlGained { .. })).await {
            ClientEvent::ControlGained { active_client_id } => {
                assert_eq!(active_client_id.as_deref(), Some("me"))
            }
            _ => unreachable!(),
        }
        assert_eq!(client.phase().await, SyncPhase::Active);
    }

    #[tokio::test]
    async fn request_control_denied() {
        let (transport, client, mut events) = settled(SyncDirection::Passive).await;

        client.request_control().await.unwrap();
        transport.push_envelope(&relay(Message::refusal(
            ErrorCode::InvalidOperation,
            "control is held by web",
            MessageType::RequestControl,
        )));

        match wait_for(&mut events, |e| matches!(e, ClientEvent::ControlDenied { .. })).await {
            ClientEvent::ControlDenied { message } => assert!(message.contains("held")),
            _ => unreachable!(),
        }
        assert_eq!(client.phase().await, SyncPhase::Passive);
    }

    #[tokio::test]
    async fn demotion_notice_moves_active_to_passive() {
        let (transport, client, mut events) = settled(SyncDirection::Active).await;

        transport.push_envelope(&relay(Message::RoleChanged(RoleChange {
            client_id: "web".into(),
            role: Role::Active,
            reason: None,
        })));
        transport.push_envelope(&relay(Message::RoleChanged(RoleChange {
            client_id: "me".into(),
            role: Role::Passive,
            reason: Some("control transferred".into()),
        })));

        let peer = wait_for(&mut events, |e| matches!(e, ClientEvent::PeerRoleChanged(_))).await;
        assert!(matches!(peer, ClientEvent::PeerRoleChanged(RoleChange { role: Role::Active, .. })));
        match wait_for(&mut events, |e| matches!(e, ClientEvent::ControlLost { .. })).await {
            ClientEvent::ControlLost { reason } => {
                assert_eq!(reason.as_deref(), Some("control transferred"))
            }
            _ => unreachable!(),
        }
        assert_eq!(client.phase().await, SyncPhase::Passive);
    }

    #[tokio::test]
    async fn release_control_becomes_passive() {
        let (transport, client, _events) = settled(SyncDirection::Active).await;

        client.release_control().await.unwrap();

        assert_eq!(client.phase().await, SyncPhase::Passive);
        assert_eq!(
            transport.sent_envelopes()[0].message,
            Message::ReleaseControl
        );
    }

    #[tokio::test]
    async fn peer_presence_is_reported() {
        let (transport, client, mut events) = client_with(test_config());
        client.connect(&SessionId::new("s1")).await.unwrap();

        transport.push_envelope(&relay(Message::ClientConnected(PeerInfo {
            client_id: "web".into(),
            connection_id: "conn-1".into(),
        })));

        match wait_for(&mut events, |e| matches!(e, ClientEvent::PeerConnected(_))).await {
            ClientEvent::PeerConnected(peer) => assert_eq!(peer.client_id, "web"),
            _ => unreachable!(),
        }
    }
}
