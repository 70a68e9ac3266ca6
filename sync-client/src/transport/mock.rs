//! Mock transport for testing.
//!
//! Captures sent frames, lets tests inject inbound frames, and simulates
//! connect failures, hung connects, and relay-initiated closes.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_types::Envelope;
use tokio::sync::mpsc;

#[derive(Debug)]
enum MockFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Mock transport for testing.
///
/// Clones share state, so a test keeps one clone while the client owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    incoming: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<MockFrame>>>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connect_count: usize,
    connected_url: Option<String>,
    sent_messages: Vec<String>,
    incoming_tx: Option<mpsc::UnboundedSender<MockFrame>>,
    fail_connects: usize,
    hang_next_connect: bool,
    fail_next_send: Option<String>,
    on_connect: Vec<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a raw text frame to the next `recv()`.
    ///
    /// Returns false if not connected.
    pub fn push_incoming(&self, text: impl Into<String>) -> bool {
        self.inner()
            .incoming_tx
            .as_ref()
            .is_some_and(|tx| tx.send(MockFrame::Text(text.into())).is_ok())
    }

    /// Deliver an envelope to the next `recv()`.
    pub fn push_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(text) => self.push_incoming(text),
            Err(_) => false,
        }
    }

    /// Queue an envelope the relay sends as soon as the next connect()
    /// succeeds.
    pub fn push_on_connect(&self, envelope: &Envelope) {
        if let Ok(text) = envelope.to_json() {
            self.inner().on_connect.push(text);
        }
    }

    /// Simulate the relay closing the channel with `code`.
    pub fn drop_connection(&self, code: u16, reason: &str) {
        let mut inner = self.inner();
        if let Some(tx) = inner.incoming_tx.take() {
            let _ = tx.send(MockFrame::Close {
                code,
                reason: reason.to_string(),
            });
        }
        inner.connected = false;
    }

    /// Get all frames that were sent.
    pub fn sent_messages(&self) -> Vec<String> {
        self.inner().sent_messages.clone()
    }

    /// Sent frames decoded as envelopes.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent_messages()
            .iter()
            .filter_map(|text| Envelope::from_json(text).ok())
            .collect()
    }

    /// The URL of the most recent connect.
    pub fn connected_url(&self) -> Option<String> {
        self.inner().connected_url.clone()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.inner().connect_count
    }

    /// Cause the next connect() to fail.
    pub fn fail_next_connect(&self) {
        self.fail_connects(1);
    }

    /// Cause the next `n` connect() calls to fail.
    pub fn fail_connects(&self, n: usize) {
        self.inner().fail_connects = n;
    }

    /// Cause the next connect() to never complete.
    pub fn hang_next_connect(&self) {
        self.inner().hang_next_connect = true;
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner().fail_next_send = Some(error.to_string());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let hang = {
            let mut inner = self.inner();
            if inner.fail_connects > 0 {
                inner.fail_connects -= 1;
                return Err(TransportError::ConnectionFailed("connection refused".into()));
            }
            std::mem::take(&mut inner.hang_next_connect)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.incoming.lock().await = Some(rx);

        let mut inner = self.inner();
        inner.connected = true;
        inner.connect_count += 1;
        inner.connected_url = Some(url.to_string());
        for text in std::mem::take(&mut inner.on_connect) {
            let _ = tx.send(MockFrame::Text(text));
        }
        inner.incoming_tx = Some(tx);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        let mut inner = self.inner();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(text);
        Ok(())
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut incoming = self.incoming.lock().await;
        let rx = incoming.as_mut().ok_or(TransportError::NotConnected)?;

        match rx.recv().await {
            Some(MockFrame::Text(text)) => Ok(text),
            Some(MockFrame::Close { code, reason }) => {
                Err(TransportError::ClosedByPeer { code, reason })
            }
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.inner().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner();
        inner.connected = false;
        inner.incoming_tx = None;
        Ok(())
    }
}
