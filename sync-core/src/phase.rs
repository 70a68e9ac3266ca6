//! Sync phase state machine.
//!
//! A pure, side-effect-free machine tracking which part of the sync
//! lifecycle one client instance is in, and which public operations that
//! phase permits. The client crate feeds it local calls and inbound protocol
//! events; this module never performs I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use sync_types::{ErrorCode, SyncDirection};

/// The seven client-side sync phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// No channel.
    #[default]
    Disconnected,
    /// Channel being opened.
    Connecting,
    /// Connected, no direction chosen.
    ConnectedIdle,
    /// Asked to receive state, waiting for the relay's assignment.
    InitializingPull,
    /// Asked to publish state, waiting for the relay's assignment.
    InitializingPush,
    /// Sole publisher of tutorial state.
    Active,
    /// Receives tutorial state.
    Passive,
}

impl SyncPhase {
    /// Whether `next` is reachable from this phase in one step.
    pub fn can_transition_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;

        if next == Disconnected {
            return self != Disconnected;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, ConnectedIdle)
                | (ConnectedIdle, InitializingPull)
                | (ConnectedIdle, InitializingPush)
                | (InitializingPull, Active)
                | (InitializingPull, Passive)
                | (InitializingPull, ConnectedIdle)
                | (InitializingPush, Active)
                | (InitializingPush, Passive)
                | (InitializingPush, ConnectedIdle)
                | (Active, Passive)
                | (Passive, Active)
        )
    }

    /// Whether a channel is open in this phase.
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Connecting)
    }

    /// Whether the client is waiting for a direction assignment.
    pub fn is_initializing(self) -> bool {
        matches!(self, Self::InitializingPull | Self::InitializingPush)
    }

    /// The settled phase a direction maps to.
    pub fn for_direction(direction: SyncDirection) -> Self {
        match direction {
            SyncDirection::Active => Self::Active,
            SyncDirection::Passive => Self::Passive,
        }
    }

    /// The initializing phase a direction request moves through.
    pub fn initializing(direction: SyncDirection) -> Self {
        match direction {
            SyncDirection::Active => Self::InitializingPush,
            SyncDirection::Passive => Self::InitializingPull,
        }
    }

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ConnectedIdle => "connected_idle",
            Self::InitializingPull => "initializing_pull",
            Self::InitializingPush => "initializing_push",
            Self::Active => "active",
            Self::Passive => "passive",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase-gated public operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Publish tutorial state.
    SendState,
    /// Ask the active peer for its state.
    RequestState,
    /// Pick a sync direction.
    ChooseDirection,
    /// Offer write authority to peers.
    OfferControl,
    /// Ask the relay for write authority.
    RequestControl,
    /// Accept or decline a received offer.
    RespondToOffer,
    /// Give up write authority.
    ReleaseControl,
}

impl Operation {
    /// Whether this operation may run in `phase`.
    pub fn is_permitted_in(self, phase: SyncPhase) -> bool {
        use SyncPhase::*;

        match self {
            Self::SendState | Self::OfferControl | Self::ReleaseControl => phase == Active,
            Self::RequestState => matches!(phase, Passive | InitializingPull),
            Self::ChooseDirection => phase == ConnectedIdle,
            Self::RequestControl | Self::RespondToOffer => phase == Passive,
        }
    }

    /// Human-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendState => "send tutorial state",
            Self::RequestState => "request state",
            Self::ChooseDirection => "choose sync direction",
            Self::OfferControl => "offer control",
            Self::RequestControl => "request control",
            Self::RespondToOffer => "respond to control offer",
            Self::ReleaseControl => "release control",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase machine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    /// Transition outside the legal table.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Phase at the time of the attempt.
        from: SyncPhase,
        /// Requested phase.
        to: SyncPhase,
    },

    /// Operation not permitted in the current phase.
    #[error("cannot {operation} while {phase}")]
    InvalidOperation {
        /// The refused operation.
        operation: Operation,
        /// Phase at the time of the attempt.
        phase: SyncPhase,
    },
}

impl PhaseError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::InvalidOperation { .. } => ErrorCode::InvalidOperation,
        }
    }
}

/// Inputs that drive the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Local connect call.
    ConnectRequested,
    /// Channel opened.
    ConnectSucceeded,
    /// Channel failed to open.
    ConnectFailed,
    /// Channel closed or local disconnect.
    Disconnected,
    /// Local direction choice.
    DirectionRequested(SyncDirection),
    /// Relay assigned a direction.
    DirectionAssigned(SyncDirection),
    /// No assignment arrived in time.
    DirectionTimedOut,
    /// Write authority granted.
    ControlGained,
    /// Write authority lost.
    ControlLost,
}

/// Result of feeding an event to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Phase before the event.
    pub from: SyncPhase,
    /// Phase after the event.
    pub to: SyncPhase,
}

impl Transition {
    /// Whether the phase actually changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Holds the current phase and enforces the transition table.
#[derive(Debug, Clone, Default)]
pub struct PhaseMachine {
    phase: SyncPhase,
}

impl PhaseMachine {
    /// Create a new machine in [`SyncPhase::Disconnected`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The current phase.
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Move to `to`, leaving the phase unchanged on an illegal request.
    pub fn transition(&mut self, to: SyncPhase) -> Result<Transition, PhaseError> {
        let from = self.phase;
        if !from.can_transition_to(to) {
            return Err(PhaseError::InvalidTransition { from, to });
        }
        self.phase = to;
        Ok(Transition { from, to })
    }

    /// Fail with [`PhaseError::InvalidOperation`] unless `operation` is
    /// permitted now.
    pub fn check(&self, operation: Operation) -> Result<(), PhaseError> {
        if operation.is_permitted_in(self.phase) {
            Ok(())
        } else {
            Err(PhaseError::InvalidOperation {
                operation,
                phase: self.phase,
            })
        }
    }

    /// Apply an event.
    ///
    /// Assignment and control events that name the phase the machine is
    /// already in succeed without a change. `Disconnected` while already
    /// disconnected is likewise a no-op.
    pub fn on_event(&mut self, event: PhaseEvent) -> Result<Transition, PhaseError> {
        let from = self.phase;
        let target = match event {
            PhaseEvent::ConnectRequested => SyncPhase::Connecting,
            PhaseEvent::ConnectSucceeded => SyncPhase::ConnectedIdle,
            PhaseEvent::ConnectFailed | PhaseEvent::Disconnected => SyncPhase::Disconnected,
            PhaseEvent::DirectionRequested(direction) => SyncPhase::initializing(direction),
            PhaseEvent::DirectionAssigned(direction) => SyncPhase::for_direction(direction),
            PhaseEvent::DirectionTimedOut => SyncPhase::ConnectedIdle,
            PhaseEvent::ControlGained => SyncPhase::Active,
            PhaseEvent::ControlLost => SyncPhase::Passive,
        };

        let idempotent = matches!(
            event,
            PhaseEvent::Disconnected
                | PhaseEvent::DirectionAssigned(_)
                | PhaseEvent::ControlGained
                | PhaseEvent::ControlLost
        );
        if idempotent && from == target {
            return Ok(Transition { from, to: target });
        }
        if event == PhaseEvent::DirectionTimedOut && !from.is_initializing() {
            return Err(PhaseError::InvalidTransition { from, to: target });
        }

        self.transition(target)
    }
}
