//! Transport abstraction for tutor-sync.
//!
//! This module provides a pluggable transport layer that abstracts the
//! realtime channel to the relay (WebSocket in production, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented, carrying JSON text
//! frames:
//! - `connect()` opens the channel URL
//! - `send()` transmits one envelope
//! - `recv()` waits for the next envelope
//! - `close()` gracefully terminates
//!
//! `send()` and `recv()` may run concurrently: one task reads while others
//! write.

mod mock;
mod ws;

pub use mock::MockTransport;
pub use ws::WsTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed without a close frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// The relay closed the channel.
    #[error("closed by peer ({code}): {reason}")]
    ClosedByPeer {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Transport trait for sending and receiving protocol frames.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel to `url`.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Send one text frame.
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Receive the next text frame.
    ///
    /// Blocks until a frame arrives or the channel closes.
    async fn recv(&self) -> Result<String, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
