//! # sync-client
//!
//! Client library for tutor-sync.
//!
//! This is the library desktop and web hosts use to share tutorial progress
//! through a relay session.
//!
//! ## Features
//!
//! - **Session creation**: `POST` to the relay's session endpoint
//! - **Reconnecting channel**: connect timeout, fixed or exponential retry,
//!   terminal close codes honored
//! - **Phase-gated operations**: every call is checked against the
//!   sync-core phase machine before anything touches the network
//! - **Transport Abstraction**: Pluggable transport layer (WebSocket, mock)
//!
//! ## Example
//!
//! ```ignore
//! use tutor_sync_client::{ClientConfig, ClientEvent, SyncClient, WsTransport};
//!
//! let (client, mut events) = SyncClient::new(ClientConfig::from_env()?, WsTransport::new());
//! client.connect(&session_id).await?;
//! client.pull_state_from_peer().await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::TutorialStateReceived { state, .. } = event {
//!         render(state);
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod transport;

pub use client::{ClientEvent, ControlOffer, OfferResponder, SyncClient};
pub use config::{ClientConfig, ConfigError};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionStatus};
pub use dispatcher::{MessageDispatcher, MessageHandler};
pub use error::ClientError;
pub use transport::{MockTransport, Transport, TransportError, WsTransport};
