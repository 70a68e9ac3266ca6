//! Generic duplex message channel between the relay core and one client.
//!
//! The orchestrator never touches sockets. The HTTP layer bridges a
//! WebSocket onto a [`ChannelPeer`]; tests drive the peer directly.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON text frame.
    Text(String),
    /// Liveness probe.
    Ping,
    /// Close the channel with a code and reason.
    Close {
        /// Close code (see `sync_types::close_code`).
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// JSON text frame.
    Text(String),
    /// Answer to a ping.
    Pong,
    /// The client side went away.
    Closed,
}

/// Relay-side sending half, cloneable and stored in the registry.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    closed: Arc<watch::Sender<bool>>,
}

impl ChannelHandle {
    /// Queue a text frame. Returns false if the channel is closed.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.is_open() && self.outbound.send(OutboundFrame::Text(text.into())).is_ok()
    }

    /// Queue a ping. Returns false if the channel is closed.
    pub fn ping(&self) -> bool {
        self.is_open() && self.outbound.send(OutboundFrame::Ping).is_ok()
    }

    /// Close the channel. Idempotent.
    pub fn close(&self, code: u16, reason: &str) {
        if !self.is_open() {
            return;
        }
        let _ = self.outbound.send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
        self.closed.send_replace(true);
    }

    /// Whether frames can still be sent.
    pub fn is_open(&self) -> bool {
        !*self.closed.borrow() && !self.outbound.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Relay-side channel handed to `handle_upgrade`.
#[derive(Debug)]
pub struct DuplexChannel {
    /// Sending half.
    pub handle: ChannelHandle,
    /// Receiving half.
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
    /// Client ID supplied at upgrade time, if any.
    pub client_id: Option<String>,
}

/// Client-side end of a [`DuplexChannel`].
#[derive(Debug)]
pub struct ChannelPeer {
    /// Frames from the relay.
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    /// Frames to the relay.
    pub inbound: mpsc::UnboundedSender<InboundFrame>,
}

impl DuplexChannel {
    /// Create a connected channel and its peer end.
    pub fn pair(client_id: Option<String>) -> (Self, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let channel = Self {
            handle: ChannelHandle {
                outbound: out_tx,
                closed: Arc::new(closed),
            },
            inbound: in_rx,
            client_id,
        };
        let peer = ChannelPeer {
            outbound: out_rx,
            inbound: in_tx,
        };
        (channel, peer)
    }
}

impl ChannelPeer {
    /// Send a text frame to the relay.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(InboundFrame::Text(text.into())).is_ok()
    }

    /// Answer a ping.
    pub fn send_pong(&self) -> bool {
        self.inbound.send(InboundFrame::Pong).is_ok()
    }

    /// Report that the client went away.
    pub fn close(&self) {
        let _ = self.inbound.send(InboundFrame::Closed);
    }

    /// Next frame from the relay, or `None` once the relay dropped its end.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }
}
