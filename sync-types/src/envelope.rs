//! Envelope - the JSON frame wrapper for all sync messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Message, MessageType, SyncError};

/// Current protocol version carried by every frame.
pub const PROTOCOL_VERSION: &str = "1.0";

/// `clientId` used on frames the relay itself originates.
pub const RELAY_CLIENT_ID: &str = "relay";

/// One protocol frame.
///
/// On the wire:
/// `{ "type", "clientId", "data", "timestamp", "protocol_version" }`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The typed message.
    pub message: Message,
    /// Sender's client ID.
    pub client_id: String,
    /// Epoch milliseconds at construction.
    pub timestamp: u64,
    /// Sender's protocol version.
    pub protocol_version: String,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    message_type: MessageType,
    #[serde(rename = "clientId")]
    client_id: &'a str,
    data: Value,
    timestamp: u64,
    protocol_version: &'a str,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    message_type: Option<String>,
    #[serde(rename = "clientId", default)]
    client_id: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    protocol_version: Option<String>,
}

impl Envelope {
    /// Wrap a message for sending, stamped with the current time.
    pub fn new(message: Message, client_id: impl Into<String>) -> Self {
        Self {
            message,
            client_id: client_id.into(),
            timestamp: now_ms(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Wrap a message originated by the relay.
    pub fn from_relay(message: Message) -> Self {
        Self::new(message, RELAY_CLIENT_ID)
    }

    /// The message type discriminator.
    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Whether this frame's protocol version shares our major version.
    pub fn is_compatible(&self) -> bool {
        is_compatible_version(&self.protocol_version)
    }

    /// Encode as JSON text.
    pub fn to_json(&self) -> Result<String, SyncError> {
        let wire = WireEnvelope {
            message_type: self.message_type(),
            client_id: &self.client_id,
            data: self.message.data()?,
            timestamp: self.timestamp,
            protocol_version: &self.protocol_version,
        };
        serde_json::to_string(&wire).map_err(SyncError::Serialization)
    }

    /// Decode JSON text.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidMessage`] if the text is not a JSON object or
    ///   lacks a `type` string
    /// - [`SyncError::UnknownMessageType`] if `type` is outside the enumeration
    /// - [`SyncError::InvalidPayload`] if `data` does not fit the type
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| SyncError::InvalidMessage(e.to_string()))?;

        let type_name = raw
            .message_type
            .ok_or_else(|| SyncError::InvalidMessage("missing message type".into()))?;
        let message_type: MessageType = type_name.parse()?;
        let message = Message::from_parts(message_type, raw.data)?;

        Ok(Self {
            message,
            client_id: raw.client_id.unwrap_or_default(),
            timestamp: raw.timestamp.unwrap_or_else(now_ms),
            protocol_version: raw
                .protocol_version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
        })
    }
}

/// Whether `version` shares the major component of [`PROTOCOL_VERSION`].
pub fn is_compatible_version(version: &str) -> bool {
    major(version).is_some() && major(version) == major(PROTOCOL_VERSION)
}

fn major(version: &str) -> Option<&str> {
    version.split('.').next().filter(|m| !m.is_empty())
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
