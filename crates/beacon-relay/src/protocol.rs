//! Relay wire protocol.
//!
//! Defines the outbound event envelope, the error envelope, the inbound
//! worker frame and the closed set of event kinds with lifecycle effect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// WebSocket close code used when an ingest connection is superseded.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close reason sent to a superseded ingest connection.
pub const REPLACED_REASON: &str = "replaced by new connection";

/// Default reason recorded for an `interrupted` event without one.
pub const DEFAULT_INTERRUPT_REASON: &str = "User interrupted";

/// Default message recorded for a fatal `error` event without one.
pub const DEFAULT_FATAL_MESSAGE: &str = "Fatal error";

/// Outbound event envelope sent to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    /// Store-assigned event id
    pub event_id: i64,
    /// Execution the event belongs to
    pub execution_id: Uuid,
    /// Session the relay instance serves
    pub session_id: Uuid,
    /// Wire event type
    pub stream_event_type: String,
    /// Event time as an ISO-8601 string
    pub timestamp: String,
    /// Parsed event payload
    pub data: Value,
}

/// Error codes surfaced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or unsupported message shape
    WsProtocolError,
    /// Store failure, formatting failure, unexpected exception
    WsInternalError,
}

/// Outbound error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always `"error"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Machine-readable error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
}

impl ErrorEnvelope {
    /// Create an error envelope with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            code,
            message: message.into(),
        }
    }

    /// Protocol-level error: the triggering message is dropped, the
    /// connection stays open.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WsProtocolError, message)
    }

    /// Internal error: logged in full server-side, surfaced generically.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WsInternalError, message)
    }

    /// Serialize for the wire.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Inbound worker message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestFrame {
    /// Wire event type (required, non-empty)
    pub stream_event_type: String,
    /// Event payload
    #[serde(default)]
    pub data: Option<Value>,
    /// Event time as an ISO-8601 string; relay clock when absent
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// The closed set of event kinds the relay interprets.
///
/// Everything else is persisted and broadcast with no side effect; the
/// `heartbeat`/`pong`/`started` family sent by the worker layer lands in
/// `Other` on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Agent handshake carrying the external session id to capture
    Kilocode,
    /// Worker finished; carries exit code and optionally the branch
    Complete,
    /// Execution was interrupted
    Interrupted,
    /// Worker error report; only fatal ones have lifecycle effect
    Error,
    /// No lifecycle effect
    Other,
}

impl EventKind {
    /// Classify a wire event type.
    #[must_use]
    pub fn of(event_type: &str) -> Self {
        match event_type {
            "kilocode" => Self::Kilocode,
            "complete" => Self::Complete,
            "interrupted" => Self::Interrupted,
            "error" => Self::Error,
            _ => Self::Other,
        }
    }
}

/// Payload of a `kilocode` event. Loosely validated; unknown fields pass
/// through untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KilocodePayload {
    /// Inner agent event name
    #[serde(default)]
    pub event: Option<String>,
    /// External agent session id
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Payload of a `complete` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    /// Worker exit code
    pub exit_code: i64,
    /// Git branch the worker left behind
    #[serde(default)]
    pub current_branch: Option<String>,
}

/// Payload of an `interrupted` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptedPayload {
    /// Why the execution was interrupted
    #[serde(default)]
    pub reason: Option<String>,
    /// Worker exit code, when known
    #[serde(default)]
    pub exit_code: Option<i64>,
}

/// Payload of an `error` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FatalErrorPayload {
    /// Whether the error terminated the worker
    pub fatal: bool,
    /// Error detail
    #[serde(default)]
    pub error: Option<String>,
    /// Fallback message
    #[serde(default)]
    pub message: Option<String>,
}
