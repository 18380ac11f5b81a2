//! Connection handles.
//!
//! The actor never touches a socket directly; it pushes frames into an
//! unbounded channel that the connection's transport task drains. The
//! channel closing is how the actor observes a dead connection.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ErrorEnvelope;

/// Frames the relay pushes toward a connection's transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A serialized JSON envelope
    Text(String),
    /// Close the socket
    Close {
        /// WebSocket close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Sending half of a connection, held by the session actor.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its transport task drains.
    #[must_use]
    pub fn channel(id: Uuid) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the transport task is still draining frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Push a text frame. Returns false if the connection is gone; the
    /// caller decides whether that matters.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(OutboundFrame::Text(text)).is_ok()
    }

    /// Push an error envelope, best effort.
    pub fn send_error(&self, envelope: &ErrorEnvelope) {
        let _ = self.tx.send(OutboundFrame::Text(envelope.to_json()));
    }

    /// Ask the transport task to close the socket, best effort.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }
}
