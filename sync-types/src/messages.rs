//! Protocol messages for the tutorial sync relay.
//!
//! Every frame carries one [`Message`], a tagged union keyed by
//! [`MessageType`]. The payload structs below are the `data` field of the
//! envelope for their type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::{ErrorCode, SyncError};

/// Closed enumeration of frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Tutorial state published by the active client
    StateUpdate,
    /// Ask the active client to re-publish its state
    RequestSync,
    /// Ask the relay for write authority
    RequestControl,
    /// Offer write authority to peers
    OfferControl,
    /// Accept a control offer
    AcceptControl,
    /// Decline a control offer
    DeclineControl,
    /// Give up write authority
    ReleaseControl,
    /// Relay confirmation of a role grant
    ConfirmTransfer,
    /// A connection's role changed
    RoleChanged,
    /// A peer joined the session
    ClientConnected,
    /// A peer left the session
    ClientDisconnected,
    /// Non-fatal error report
    Error,
    /// Ask the relay to negotiate sync directions
    CoordinateSyncDirection,
    /// Relay-assigned sync direction
    AssignSyncDirection,
}

impl MessageType {
    /// Every message type, in declaration order.
    pub const ALL: [MessageType; 14] = [
        Self::StateUpdate,
        Self::RequestSync,
        Self::RequestControl,
        Self::OfferControl,
        Self::AcceptControl,
        Self::DeclineControl,
        Self::ReleaseControl,
        Self::ConfirmTransfer,
        Self::RoleChanged,
        Self::ClientConnected,
        Self::ClientDisconnected,
        Self::Error,
        Self::CoordinateSyncDirection,
        Self::AssignSyncDirection,
    ];

    /// The wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateUpdate => "state_update",
            Self::RequestSync => "request_sync",
            Self::RequestControl => "request_control",
            Self::OfferControl => "offer_control",
            Self::AcceptControl => "accept_control",
            Self::DeclineControl => "decline_control",
            Self::ReleaseControl => "release_control",
            Self::ConfirmTransfer => "confirm_transfer",
            Self::RoleChanged => "role_changed",
            Self::ClientConnected => "client_connected",
            Self::ClientDisconnected => "client_disconnected",
            Self::Error => "error",
            Self::CoordinateSyncDirection => "coordinate_sync_direction",
            Self::AssignSyncDirection => "assign_sync_direction",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::UnknownMessageType(s.to_string()))
    }
}

/// Server-side role of a connection within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No direction chosen yet.
    #[default]
    Connected,
    /// Receives state, publishes nothing.
    Passive,
    /// Sole permitted publisher of state.
    Active,
}

/// Direction a client asks for during coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    /// Publish state to peers.
    Active,
    /// Receive state from peers.
    Passive,
}

impl SyncDirection {
    /// The direction a peer must take to pair with this one.
    pub fn complement(self) -> Self {
        match self {
            Self::Active => Self::Passive,
            Self::Passive => Self::Active,
        }
    }
}

impl From<SyncDirection> for Role {
    fn from(direction: SyncDirection) -> Self {
        match direction {
            SyncDirection::Active => Role::Active,
            SyncDirection::Passive => Role::Passive,
        }
    }
}

/// Payload of `offer_control`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlOfferPayload {
    /// Correlates the accept/decline answer with this offer.
    pub offer_id: String,
}

/// Payload of `accept_control` and `decline_control`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAnswer {
    /// The offer being answered.
    pub offer_id: String,
}

/// Payload of `confirm_transfer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfirmation {
    /// Role granted to the recipient.
    pub role: Role,
    /// Connection now holding write authority, if any.
    #[serde(default)]
    pub active_client_id: Option<String>,
}

/// Payload of `role_changed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChange {
    /// Client whose role changed.
    pub client_id: String,
    /// The new role.
    pub role: Role,
    /// Why the relay changed it, when relay-originated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of `client_connected` and `client_disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Caller-chosen client ID, or the connection ID when none was given.
    pub client_id: String,
    /// Relay-assigned connection ID.
    pub connection_id: String,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Taxonomy code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// The message type this error answers, when it refuses a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageType>,
}

/// Payload of `coordinate_sync_direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionRequest {
    /// Direction the requester wants.
    pub preferred: SyncDirection,
}

/// Payload of `assign_sync_direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionAssignment {
    /// Direction the relay assigned.
    pub direction: SyncDirection,
}

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Tutorial state (opaque to the relay)
    StateUpdate(Value),
    /// Ask the active peer to re-publish
    RequestSync,
    /// Ask for write authority
    RequestControl,
    /// Offer write authority
    OfferControl(ControlOfferPayload),
    /// Accept an offer
    AcceptControl(ControlAnswer),
    /// Decline an offer
    DeclineControl(ControlAnswer),
    /// Give up write authority
    ReleaseControl,
    /// Role grant confirmation
    ConfirmTransfer(TransferConfirmation),
    /// Role change notice
    RoleChanged(RoleChange),
    /// Peer joined
    ClientConnected(PeerInfo),
    /// Peer left
    ClientDisconnected(PeerInfo),
    /// Error report
    Error(ErrorPayload),
    /// Direction negotiation request
    CoordinateSyncDirection(DirectionRequest),
    /// Direction assignment
    AssignSyncDirection(DirectionAssignment),
}

impl Message {
    /// The discriminator for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::StateUpdate(_) => MessageType::StateUpdate,
            Self::RequestSync => MessageType::RequestSync,
            Self::RequestControl => MessageType::RequestControl,
            Self::OfferControl(_) => MessageType::OfferControl,
            Self::AcceptControl(_) => MessageType::AcceptControl,
            Self::DeclineControl(_) => MessageType::DeclineControl,
            Self::ReleaseControl => MessageType::ReleaseControl,
            Self::ConfirmTransfer(_) => MessageType::ConfirmTransfer,
            Self::RoleChanged(_) => MessageType::RoleChanged,
            Self::ClientConnected(_) => MessageType::ClientConnected,
            Self::ClientDisconnected(_) => MessageType::ClientDisconnected,
            Self::Error(_) => MessageType::Error,
            Self::CoordinateSyncDirection(_) => MessageType::CoordinateSyncDirection,
            Self::AssignSyncDirection(_) => MessageType::AssignSyncDirection,
        }
    }

    /// Build an `error` message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
            in_reply_to: None,
        })
    }

    /// Build an `error` message refusing a request of the given type.
    pub fn refusal(code: ErrorCode, message: impl Into<String>, in_reply_to: MessageType) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
            in_reply_to: Some(in_reply_to),
        })
    }

    /// Encode the payload as the envelope's `data` value.
    pub fn data(&self) -> Result<Value, SyncError> {
        let value = match self {
            Self::StateUpdate(state) => state.clone(),
            Self::RequestSync | Self::RequestControl | Self::ReleaseControl => {
                Value::Object(Default::default())
            }
            Self::OfferControl(p) => to_value(p)?,
            Self::AcceptControl(p) | Self::DeclineControl(p) => to_value(p)?,
            Self::ConfirmTransfer(p) => to_value(p)?,
            Self::RoleChanged(p) => to_value(p)?,
            Self::ClientConnected(p) | Self::ClientDisconnected(p) => to_value(p)?,
            Self::Error(p) => to_value(p)?,
            Self::CoordinateSyncDirection(p) => to_value(p)?,
            Self::AssignSyncDirection(p) => to_value(p)?,
        };
        Ok(value)
    }

    /// Decode a payload for the given type.
    ///
    /// `null` data is treated as an empty object.
    pub fn from_parts(message_type: MessageType, data: Value) -> Result<Self, SyncError> {
        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data
        };

        let message = match message_type {
            MessageType::StateUpdate => Self::StateUpdate(data),
            MessageType::RequestSync => Self::RequestSync,
            MessageType::RequestControl => Self::RequestControl,
            MessageType::ReleaseControl => Self::ReleaseControl,
            MessageType::OfferControl => Self::OfferControl(payload(message_type, data)?),
            MessageType::AcceptControl => Self::AcceptControl(payload(message_type, data)?),
            MessageType::DeclineControl => Self::DeclineControl(payload(message_type, data)?),
            MessageType::ConfirmTransfer => Self::ConfirmTransfer(payload(message_type, data)?),
            MessageType::RoleChanged => Self::RoleChanged(payload(message_type, data)?),
            MessageType::ClientConnected => Self::ClientConnected(payload(message_type, data)?),
            MessageType::ClientDisconnected => {
                Self::ClientDisconnected(payload(message_type, data)?)
            }
            MessageType::Error => Self::Error(payload(message_type, data)?),
            MessageType::CoordinateSyncDirection => {
                Self::CoordinateSyncDirection(payload(message_type, data)?)
            }
            MessageType::AssignSyncDirection => {
                Self::AssignSyncDirection(payload(message_type, data)?)
            }
        };
        Ok(message)
    }
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value, SyncError> {
    serde_json::to_value(payload).map_err(SyncError::Serialization)
}

fn payload<T: DeserializeOwned>(message_type: MessageType, data: Value) -> Result<T, SyncError> {
    serde_json::from_value(data).map_err(|e| SyncError::InvalidPayload {
        message_type: message_type.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_type_parses_from_its_wire_name() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
    }

    #[test]
    fn wire_name_matches_serde_name() {
        for t in MessageType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = "teleport".parse::<MessageType>().unwrap_err();
        assert!(matches!(err, SyncError::UnknownMessageType(t) if t == "teleport"));
    }

    #[test]
    fn complement_flips_direction() {
        assert_eq!(SyncDirection::Active.complement(), SyncDirection::Passive);
        assert_eq!(SyncDirection::Passive.complement(), SyncDirection::Active);
        assert_eq!(Role::from(SyncDirection::Passive), Role::Passive);
    }

    #[test]
    fn direction_uses_uppercase_wire_form() {
        let data = Message::CoordinateSyncDirection(DirectionRequest {
            preferred: SyncDirection::Active,
        })
        .data()
        .unwrap();
        assert_eq!(data, json!({ "preferred": "ACTIVE" }));
    }

    #[test]
    fn null_data_decodes_unit_messages() {
        let msg = Message::from_parts(MessageType::RequestControl, Value::Null).unwrap();
        assert_eq!(msg, Message::RequestControl);
    }

    #[test]
    fn mismatched_payload_is_invalid() {
        let err = Message::from_parts(MessageType::AssignSyncDirection, json!({ "direction": 7 }))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload { .. }));
    }

    #[test]
    fn refusal_carries_request_type() {
        let msg = Message::refusal(
            ErrorCode::InvalidOperation,
            "control held",
            MessageType::RequestControl,
        );
        let data = msg.data().unwrap();
        assert_eq!(data["code"], "INVALID_OPERATION");
        assert_eq!(data["inReplyTo"], "request_control");
    }

    #[test]
    fn role_change_omits_empty_reason() {
        let data = Message::RoleChanged(RoleChange {
            client_id: "a".into(),
            role: Role::Passive,
            reason: None,
        })
        .data()
        .unwrap();
        assert_eq!(data, json!({ "clientId": "a", "role": "passive" }));
    }
}
