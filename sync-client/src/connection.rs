//! Client connection manager.
//!
//! Owns the channel lifecycle: connect with a timeout, a supervisor task that
//! validates inbound envelopes, and reconnect after unexpected drops. All
//! outcomes are reported as [`ConnectionEvent`]s on one channel, in order.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::transport::{Transport, TransportError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_types::{close_code, Envelope, ErrorCode, SessionId, SyncError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No channel.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Channel open.
    Connected,
    /// This client just handed write authority to a peer.
    GivenAwayControl,
    /// This client just took write authority.
    TakenBackControl,
    /// The last connect attempt failed.
    Error,
}

/// Everything the manager reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Status changed.
    StatusChanged(ConnectionStatus),
    /// A valid inbound envelope.
    Message(Envelope),
    /// A non-fatal problem (bad frame, version mismatch, lost connection).
    Error {
        /// Taxonomy code.
        code: ErrorCode,
        /// Details.
        message: String,
    },
    /// The channel closed.
    Closed {
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
    /// A reconnect attempt succeeded.
    Reconnected,
    /// The reconnect budget ran out; the manager stays disconnected.
    MaxReconnectAttemptsExceeded,
}

#[derive(Debug)]
struct ManagerState {
    status: ConnectionStatus,
    in_flight: bool,
    session_id: Option<SessionId>,
    attempts: u32,
    closing: bool,
    /// Bumped by every `connect()`; a supervisor from an older epoch is stale.
    epoch: u64,
    supervisor: Option<JoinHandle<()>>,
}

/// Channel lifecycle for one client.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    config: ClientConfig,
    state: Mutex<ManagerState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl<T: Transport> std::fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .field("connected", &self.transport.is_connected())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a disconnected manager and the receiver for its events.
    pub fn new(
        transport: T,
        config: ClientConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            transport: Arc::new(transport),
            config,
            state: Mutex::new(ManagerState {
                status: ConnectionStatus::Disconnected,
                in_flight: false,
                session_id: None,
                attempts: 0,
                closing: false,
                epoch: 0,
                supervisor: None,
            }),
            events,
        });
        (manager, rx)
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut state = self.state();
            let changed = state.status != status;
            state.status = status;
            changed
        };
        if changed {
            self.emit(ConnectionEvent::StatusChanged(status));
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    /// Whether the channel is open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Session of the current or last connection.
    pub fn session_id(&self) -> Option<SessionId> {
        self.state().session_id.clone()
    }

    /// Open a channel to `session`.
    ///
    /// Fails with `CONNECTION_FAILED` if an attempt is already in flight, if
    /// the transport refuses, or if the connection timeout elapses.
    pub async fn connect(self: &Arc<Self>, session: &SessionId) -> Result<(), ClientError> {
        let (epoch, stale) = {
            let mut state = self.state();
            if state.in_flight {
                return Err(ClientError::ConnectionFailed(
                    "a connection attempt is already in flight".into(),
                ));
            }
            state.in_flight = true;
            state.session_id = Some(session.clone());
            state.closing = false;
            state.attempts = 0;
            state.epoch += 1;
            (state.epoch, state.supervisor.take())
        };
        if let Some(stale) = stale {
            stale.abort();
        }
        self.open(session).await?;

        let supervisor = tokio::spawn(supervise(Arc::clone(self), epoch));
        self.state().supervisor = Some(supervisor);
        Ok(())
    }

    fn is_stale(&self, epoch: u64) -> bool {
        let state = self.state();
        state.closing || state.epoch != epoch
    }

    /// Caller must have set `in_flight`.
    async fn open(&self, session: &SessionId) -> Result<(), ClientError> {
        self.set_status(ConnectionStatus::Connecting);

        let result = self.try_open(session).await;
        self.state().in_flight = false;

        match result {
            Ok(()) => {
                self.state().attempts = 0;
                self.set_status(ConnectionStatus::Connected);
                tracing::info!("Connected to session {}", session);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Connect to session {} failed: {}", session, e);
                self.set_status(ConnectionStatus::Error);
                self.emit(ConnectionEvent::Error {
                    code: ErrorCode::ConnectionFailed,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn try_open(&self, session: &SessionId) -> Result<(), ClientError> {
        let url = self.config.channel_url(session)?;
        let timeout = self.config.connection_timeout;

        match tokio::time::timeout(timeout, self.transport.connect(&url)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClientError::ConnectionFailed(e.to_string())),
            Err(_) => {
                let _ = self.transport.close().await;
                Err(ClientError::ConnectionFailed(format!(
                    "connection timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Send one envelope.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        if !self.transport.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let text = envelope.to_json()?;
        self.transport.send(text).await?;
        Ok(())
    }

    /// Close the channel and stop reconnecting. Idempotent.
    ///
    /// Returns once the supervisor has stopped, so a following `connect()`
    /// never races the old channel's close. An explicit close is not
    /// reported as [`ConnectionEvent::Closed`].
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut state = self.state();
            state.closing = true;
            state.supervisor.take()
        };
        if let Err(e) = self.transport.close().await {
            tracing::debug!("Close failed: {}", e);
        }
        if let Some(mut supervisor) = supervisor {
            let wait = self.config.connection_timeout;
            if tokio::time::timeout(wait, &mut supervisor).await.is_err() {
                tracing::debug!("Supervisor still running after {:?}, aborting", wait);
                supervisor.abort();
                self.state().in_flight = false;
                let _ = self.transport.close().await;
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Briefly report an informational status, then return to `Connected`.
    pub fn flash_status(&self, status: ConnectionStatus) {
        if self.status() == ConnectionStatus::Connected {
            self.set_status(status);
            self.set_status(ConnectionStatus::Connected);
        }
    }

    fn accept_frame(&self, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) if !envelope.is_compatible() => {
                tracing::warn!(
                    "Dropping frame with protocol version {}",
                    envelope.protocol_version
                );
                self.emit(ConnectionEvent::Error {
                    code: ErrorCode::ProtocolVersion,
                    message: format!(
                        "incompatible protocol version {}",
                        envelope.protocol_version
                    ),
                });
            }
            Ok(envelope) => self.emit(ConnectionEvent::Message(envelope)),
            Err(SyncError::UnknownMessageType(kind)) => {
                tracing::warn!("Ignoring unknown message type '{}'", kind);
            }
            Err(e) => {
                tracing::warn!("Malformed frame: {}", e);
                self.emit(ConnectionEvent::Error {
                    code: ErrorCode::InvalidMessage,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Report a dropped channel. Returns whether to reconnect.
    fn on_drop(&self, error: TransportError, epoch: u64) -> bool {
        if self.is_stale(epoch) {
            tracing::info!("Connection closed");
            return false;
        }

        let (code, reason) = match error {
            TransportError::ClosedByPeer { code, reason } => (Some(code), reason),
            other => (None, other.to_string()),
        };
        let terminal = code.is_some_and(close_code::is_terminal);
        let will_reconnect =
            !terminal && self.config.auto_reconnect && self.config.max_reconnect_attempts > 0;

        tracing::warn!("Connection lost (code {:?}): {}", code, reason);
        self.emit(ConnectionEvent::Error {
            code: ErrorCode::ConnectionLost,
            message: reason.clone(),
        });
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(ConnectionEvent::Closed {
            code,
            reason,
            will_reconnect,
        });
        will_reconnect
    }

    /// Retry until connected or out of budget. Returns whether the channel
    /// is open again.
    async fn reconnect(&self, epoch: u64) -> bool {
        loop {
            let (attempt, session) = {
                let mut state = self.state();
                if state.closing || state.epoch != epoch {
                    return false;
                }
                let Some(session) = state.session_id.clone() else {
                    return false;
                };
                state.attempts += 1;
                (state.attempts, session)
            };

            if attempt > self.config.max_reconnect_attempts {
                tracing::warn!(
                    "Giving up after {} reconnect attempts",
                    self.config.max_reconnect_attempts
                );
                self.set_status(ConnectionStatus::Disconnected);
                self.emit(ConnectionEvent::Error {
                    code: ErrorCode::MaxReconnectAttemptsExceeded,
                    message: format!(
                        "gave up after {} reconnect attempts",
                        self.config.max_reconnect_attempts
                    ),
                });
                self.emit(ConnectionEvent::MaxReconnectAttemptsExceeded);
                return false;
            }

            let delay = self.config.reconnect_policy.delay_for(attempt);
            tracing::info!("Reconnect attempt {} in {:?}", attempt, delay);
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;

            {
                let mut state = self.state();
                if state.closing || state.epoch != epoch || state.in_flight {
                    return false;
                }
                state.in_flight = true;
            }
            if self.open(&session).await.is_ok() {
                if self.is_stale(epoch) {
                    // Disconnected while the attempt was in flight.
                    let _ = self.transport.close().await;
                    return false;
                }
                return true;
            }
        }
    }
}

/// Reads frames until the channel drops, then reconnects if allowed. One
/// supervisor runs per `connect()`.
async fn supervise<T: Transport>(manager: Arc<ConnectionManager<T>>, epoch: u64) {
    loop {
        let error = loop {
            match manager.transport.recv().await {
                Ok(text) => manager.accept_frame(&text),
                Err(e) => break e,
            }
        };

        if !manager.on_drop(error, epoch) || !manager.reconnect(epoch).await {
            return;
        }
        manager.emit(ConnectionEvent::Reconnected);
    }
}
