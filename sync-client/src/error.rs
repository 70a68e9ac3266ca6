//! Client errors.

use crate::config::ConfigError;
use crate::transport::TransportError;
use sync_core::PhaseError;
use sync_types::{ErrorCode, SyncError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Operation not allowed in the current phase.
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// Frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] SyncError),

    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected to the relay.
    #[error("not connected")]
    NotConnected,

    /// The control offer was already answered or withdrawn.
    #[error("control offer {0} is no longer pending")]
    OfferNotPending(String),

    /// Session endpoint request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Session endpoint answered with an error status.
    #[error("relay returned {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(TransportError::Timeout) => ErrorCode::Timeout,
            Self::Transport(TransportError::ConnectionFailed(_)) | Self::ConnectionFailed(_) => {
                ErrorCode::ConnectionFailed
            }
            Self::Transport(_) | Self::NotConnected => ErrorCode::ConnectionLost,
            Self::Phase(e) => e.code(),
            Self::Protocol(_) => ErrorCode::InvalidMessage,
            Self::OfferNotPending(_) => ErrorCode::InvalidOperation,
            Self::Http(e) if e.is_connect() || e.is_timeout() => ErrorCode::ConnectionFailed,
            Self::Http(_) | Self::Server { .. } => ErrorCode::ServerError,
            Self::Config(_) => ErrorCode::ConnectionFailed,
        }
    }
}
