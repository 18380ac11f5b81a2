//! Formatter - Stored event to wire envelope mapping.

use beacon_store::StoredEvent;
use chrono::SecondsFormat;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::WireEvent;

/// Map a stored event to the envelope sent to observers.
///
/// The stored payload must be valid JSON; a parse failure here means the
/// log itself is corrupt and surfaces as an internal error, never as a
/// protocol error.
pub fn format(event: &StoredEvent, session_id: Uuid) -> Result<WireEvent> {
    let data = serde_json::from_str(&event.payload)?;
    Ok(WireEvent {
        event_id: event.id,
        execution_id: event.execution_id,
        session_id,
        stream_event_type: event.event_type.clone(),
        timestamp: event
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        data,
    })
}
