//! WebSocket endpoints for Beacon
//!
//! Provides the two relay endpoints:
//! - /v1/sessions/:session_id/stream - observer distribution endpoint
//! - /v1/sessions/:session_id/ingest - worker ingestion endpoint

pub mod ingest;
pub mod stream;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;

use beacon_relay::OutboundFrame;

/// Forward one actor frame to the socket. Returns false once the socket
/// should be considered finished.
pub(crate) async fn forward_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: OutboundFrame,
) -> bool {
    match frame {
        OutboundFrame::Text(json) => sender.send(Message::Text(json)).await.is_ok(),
        OutboundFrame::Close { code, reason } => {
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            false
        }
    }
}
