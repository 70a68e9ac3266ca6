//! Error types for the tutorial sync protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding or encoding protocol frames.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The frame is not valid JSON or is missing required envelope fields.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The frame names a message type outside the closed enumeration.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The `data` field does not match the payload shape for its type.
    #[error("invalid payload for {message_type}: {reason}")]
    InvalidPayload {
        /// The message type whose payload failed to decode.
        message_type: String,
        /// Decoder error text.
        reason: String,
    },

    /// JSON serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Error taxonomy shared by the relay and its clients.
///
/// Serialized as SCREAMING_SNAKE_CASE inside `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Opening the channel failed or timed out.
    ConnectionFailed,
    /// An established channel went away.
    ConnectionLost,
    /// A frame could not be decoded.
    InvalidMessage,
    /// The relay reported an internal or policy failure.
    ServerError,
    /// An operation did not complete in time.
    Timeout,
    /// The reconnect budget is exhausted.
    MaxReconnectAttemptsExceeded,
    /// The peer speaks an incompatible protocol version.
    ProtocolVersion,
    /// A phase transition outside the legal table was attempted.
    InvalidStateTransition,
    /// An operation is not permitted in the current phase or role.
    InvalidOperation,
}

impl ErrorCode {
    /// The wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::ServerError => "SERVER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::MaxReconnectAttemptsExceeded => "MAX_RECONNECT_ATTEMPTS_EXCEEDED",
            Self::ProtocolVersion => "PROTOCOL_VERSION",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::InvalidOperation => "INVALID_OPERATION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
