//! Error types for sync-relay.

use sync_types::{ErrorCode, SessionId, SyncError};

/// Main error type for sync-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Session store error.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An active session already uses the requested ID.
    #[error("session already exists: {0}")]
    DuplicateSession(SessionId),
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame could not be decoded.
    #[error("invalid frame: {0}")]
    Decode(#[from] SyncError),

    /// Sender speaks an incompatible protocol version.
    #[error("protocol version mismatch: client={client}, server={server}")]
    VersionMismatch {
        /// Client protocol version.
        client: String,
        /// Server protocol version.
        server: String,
    },
}

impl ProtocolError {
    /// Taxonomy code reported back to the sender.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) => ErrorCode::InvalidMessage,
            Self::VersionMismatch { .. } => ErrorCode::ProtocolVersion,
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
