//! Realtime channel upgrade.
//!
//! Bridges an axum WebSocket onto a [`DuplexChannel`] and hands it to the
//! orchestrator. Rejections are written as close frames by the same bridge.

use crate::channel::{ChannelPeer, DuplexChannel, InboundFrame, OutboundFrame};
use crate::orchestrator::RelayOrchestrator;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::response::Response;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use sync_types::SessionId;

/// Query parameters of the channel URL.
#[derive(Debug, Default, Deserialize)]
pub struct ChannelQuery {
    session: Option<String>,
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

/// `GET {channel_path}?session=<id>&clientId=<id>`.
pub async fn channel_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ChannelQuery>,
    Extension(relay): Extension<Arc<RelayOrchestrator>>,
) -> Response {
    ws.on_upgrade(move |socket| bridge(socket, relay, query))
}

async fn bridge(socket: WebSocket, relay: Arc<RelayOrchestrator>, query: ChannelQuery) {
    let session_id = SessionId::new(query.session.unwrap_or_default());
    let (channel, peer) = DuplexChannel::pair(query.client_id);
    let ChannelPeer {
        mut outbound,
        inbound,
    } = peer;
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let (message, last) = match frame {
                OutboundFrame::Text(text) => (WsMessage::Text(text), false),
                OutboundFrame::Ping => (WsMessage::Ping(Vec::new()), false),
                OutboundFrame::Close { code, reason } => (
                    WsMessage::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            if sink.send(message).await.is_err() || last {
                break;
            }
        }
    });

    if !relay.handle_upgrade(session_id.clone(), channel).await {
        // The close frame is already queued; let the writer flush it.
        let _ = writer.await;
        return;
    }

    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let forwarded = match message {
                WsMessage::Text(text) => inbound.send(InboundFrame::Text(text)).is_ok(),
                WsMessage::Pong(_) => inbound.send(InboundFrame::Pong).is_ok(),
                WsMessage::Close(_) => break,
                // axum answers pings itself; binary frames are not part of the protocol.
                WsMessage::Ping(_) | WsMessage::Binary(_) => true,
            };
            if !forwarded {
                break;
            }
        }
        let _ = inbound.send(InboundFrame::Closed);
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    tracing::debug!("Channel bridge for session {} finished", session_id);
}
