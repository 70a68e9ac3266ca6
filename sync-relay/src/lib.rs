//! # sync-relay
//!
//! Session relay for tutor-sync.
//!
//! This crate implements a relay server that:
//! - Hosts short-lived sessions created over HTTP
//! - Accepts realtime channels from clients of a session
//! - Routes tutorial state and control frames between peers
//! - Grants write authority to at most one client per session
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                       ┌── Client B
//!            │   WebSocket (JSON)    │
//!            ├──────────────────────►│
//!        ┌───┴───────────────────────┴───┐
//!        │      RelayOrchestrator        │
//!        │  SessionStore  ConnectionReg. │
//!        │  SessionLifecycle (sweep)     │
//!        └───────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Frames are JSON envelopes `{type, clientId, data, timestamp,
//! protocol_version}`. The relay answers:
//! - `request_control` → `confirm_transfer` or `error`
//! - `coordinate_sync_direction` → `assign_sync_direction` to every peer
//! - everything else → forwarded verbatim to the session's other clients

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
mod connection;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod limits;
pub mod orchestrator;
pub mod registry;
pub mod store;

pub use channel::{ChannelPeer, DuplexChannel};
pub use config::Config;
pub use orchestrator::{RelayOrchestrator, RelayStats};
