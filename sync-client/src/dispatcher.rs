//! Message dispatcher.
//!
//! Builds outgoing envelopes stamped with this client's ID and routes
//! incoming ones to one typed callback per message kind.

use serde_json::Value;
use sync_types::{
    ControlAnswer, ControlOfferPayload, DirectionAssignment, DirectionRequest, Envelope,
    ErrorPayload, Message, PeerInfo, RoleChange, SyncDirection, TransferConfirmation,
};

/// Typed callbacks for inbound messages.
///
/// Every method defaults to a no-op; implement the ones you care about.
/// `from` is the sender's `clientId`.
#[allow(unused_variables)]
pub trait MessageHandler {
    /// A peer published tutorial state.
    fn on_state_update(&mut self, from: &str, state: Value) {}
    /// A peer asked for the current state.
    fn on_request_sync(&mut self, from: &str) {}
    /// A peer asked for write authority.
    fn on_request_control(&mut self, from: &str) {}
    /// A peer offered write authority.
    fn on_offer_control(&mut self, from: &str, offer: ControlOfferPayload) {}
    /// A peer accepted an offer.
    fn on_accept_control(&mut self, from: &str, answer: ControlAnswer) {}
    /// A peer declined an offer.
    fn on_decline_control(&mut self, from: &str, answer: ControlAnswer) {}
    /// A peer gave up write authority.
    fn on_release_control(&mut self, from: &str) {}
    /// The relay confirmed a role transfer to this client.
    fn on_confirm_transfer(&mut self, from: &str, confirmation: TransferConfirmation) {}
    /// Some connection's role changed.
    fn on_role_changed(&mut self, from: &str, change: RoleChange) {}
    /// A peer joined the session.
    fn on_client_connected(&mut self, from: &str, peer: PeerInfo) {}
    /// A peer left the session.
    fn on_client_disconnected(&mut self, from: &str, peer: PeerInfo) {}
    /// An error frame.
    fn on_error(&mut self, from: &str, error: ErrorPayload) {}
    /// A peer asked for a sync direction.
    fn on_coordinate_sync_direction(&mut self, from: &str, request: DirectionRequest) {}
    /// The relay assigned this client a direction.
    fn on_assign_sync_direction(&mut self, from: &str, assignment: DirectionAssignment) {}
}

/// Encodes outgoing and routes incoming protocol messages.
#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    client_id: String,
}

impl MessageDispatcher {
    /// Create a dispatcher sending as `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// The `clientId` stamped on outgoing frames.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Wrap `message` for sending.
    pub fn envelope(&self, message: Message) -> Envelope {
        Envelope::new(message, self.client_id.as_str())
    }

    /// `state_update` carrying `state`.
    pub fn state_update(&self, state: Value) -> Envelope {
        self.envelope(Message::StateUpdate(state))
    }

    /// `coordinate_sync_direction` asking for `preferred`.
    pub fn coordinate(&self, preferred: SyncDirection) -> Envelope {
        self.envelope(Message::CoordinateSyncDirection(DirectionRequest {
            preferred,
        }))
    }

    /// `offer_control` with `offer_id`.
    pub fn offer(&self, offer_id: &str) -> Envelope {
        self.envelope(Message::OfferControl(ControlOfferPayload {
            offer_id: offer_id.to_string(),
        }))
    }

    /// `accept_control` or `decline_control` answering `offer_id`.
    pub fn answer(&self, offer_id: &str, accept: bool) -> Envelope {
        let answer = ControlAnswer {
            offer_id: offer_id.to_string(),
        };
        self.envelope(if accept {
            Message::AcceptControl(answer)
        } else {
            Message::DeclineControl(answer)
        })
    }

    /// Route `envelope` to the matching `handler` callback.
    pub fn dispatch<H>(&self, envelope: Envelope, handler: &mut H)
    where
        H: MessageHandler + ?Sized,
    {
        let from = envelope.client_id.as_str();
        match envelope.message {
            Message::StateUpdate(state) => handler.on_state_update(from, state),
            Message::RequestSync => handler.on_request_sync(from),
            Message::RequestControl => handler.on_request_control(from),
            Message::OfferControl(offer) => handler.on_offer_control(from, offer),
            Message::AcceptControl(answer) => handler.on_accept_control(from, answer),
            Message::DeclineControl(answer) => handler.on_decline_control(from, answer),
            Message::ReleaseControl => handler.on_release_control(from),
            Message::ConfirmTransfer(confirmation) => {
                handler.on_confirm_transfer(from, confirmation)
            }
            Message::RoleChanged(change) => handler.on_role_changed(from, change),
            Message::ClientConnected(peer) => handler.on_client_connected(from, peer),
            Message::ClientDisconnected(peer) => handler.on_client_disconnected(from, peer),
            Message::Error(error) => handler.on_error(from, error),
            Message::CoordinateSyncDirection(request) => {
                handler.on_coordinate_sync_direction(from, request)
            }
            Message::AssignSyncDirection(assignment) => {
                handler.on_assign_sync_direction(from, assignment)
            }
        }
    }
}
