//! # sync-core
//!
//! Pure logic for tutor-sync (no I/O, instant tests).
//!
//! This crate holds the client-side sync phase machine, its phase-gated
//! permission table, and the reconnect delay policy. Nothing here touches
//! the network; `sync-client` interprets the results and performs the I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod phase;

pub use backoff::ReconnectPolicy;
pub use phase::{Operation, PhaseError, PhaseEvent, PhaseMachine, SyncPhase, Transition};
