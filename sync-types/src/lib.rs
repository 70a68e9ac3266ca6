//! # sync-types
//!
//! Wire format types for the tutorial sync relay protocol.
//!
//! This crate provides the foundational types used across all tutor-sync crates:
//! - [`SessionId`], [`ConnectionId`] - Identity types
//! - [`Envelope`] - JSON frame wrapper with sender and version metadata
//! - [`Message`] - Tagged union of protocol messages keyed by [`MessageType`]
//! - [`Role`], [`SyncDirection`] - Write-authority vocabulary
//! - [`SessionSummary`] - Public session shape
//! - [`SyncError`], [`ErrorCode`] - Error types and the shared taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod messages;
mod session;

pub use envelope::{is_compatible_version, now_ms, Envelope, PROTOCOL_VERSION, RELAY_CLIENT_ID};
pub use error::{ErrorCode, SyncError};
pub use ids::{ConnectionId, SessionId};
pub use messages::{
    ControlAnswer, ControlOfferPayload, DirectionAssignment, DirectionRequest, ErrorPayload,
    Message, MessageType, PeerInfo, Role, RoleChange, SyncDirection, TransferConfirmation,
};
pub use session::{close_code, CreateSessionRequest, SessionStatus, SessionSummary};
