//! Per-connection task.
//!
//! Pumps inbound frames into the orchestrator until the client goes away or
//! the relay closes the channel, then runs close handling exactly once.

use crate::channel::InboundFrame;
use crate::orchestrator::RelayOrchestrator;
use std::sync::Arc;
use sync_types::ConnectionId;
use tokio::sync::{mpsc, watch};

pub(crate) async fn run(
    relay: Arc<RelayOrchestrator>,
    id: ConnectionId,
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    mut closed: watch::Receiver<bool>,
) {
    tracing::debug!("Connection task for {} started", id);

    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(InboundFrame::Text(text)) => relay.handle_frame(&id, &text).await,
                Some(InboundFrame::Pong) => relay.handle_pong(&id).await,
                Some(InboundFrame::Closed) | None => break,
            },
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
        }
    }

    relay.handle_close(&id).await;
    tracing::debug!("Connection task for {} finished", id);
}
