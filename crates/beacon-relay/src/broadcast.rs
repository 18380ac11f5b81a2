//! Broadcast - Live fan-out of newly persisted events.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_store::{AttachmentStore, StoredEvent};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::formatter;
use crate::sink::ConnectionHandle;

/// Fans one newly ingested event out to every attached observer whose
/// filters match.
pub struct BroadcastRouter {
    attachments: Arc<dyn AttachmentStore>,
}

impl BroadcastRouter {
    /// Create a router reading observer filters from the given store.
    #[must_use]
    pub fn new(attachments: Arc<dyn AttachmentStore>) -> Self {
        Self { attachments }
    }

    /// Deliver `event` to every matching connection. Returns how many
    /// observers it was delivered to.
    ///
    /// The attachment is re-read from the store for every connection: the
    /// actor may have been rehydrated since the connection was accepted,
    /// so an in-memory copy of the filters is not authoritative. A
    /// per-connection failure is logged and skipped; detecting a dead
    /// socket is the transport layer's job, not the broadcaster's.
    pub async fn dispatch(
        &self,
        event: &StoredEvent,
        observers: &HashMap<Uuid, ConnectionHandle>,
    ) -> usize {
        let mut delivered = 0;

        for (conn_id, conn) in observers {
            let attachment = match self.attachments.observer(*conn_id).await {
                Ok(Some(attachment)) => attachment,
                Ok(None) => {
                    warn!(conn_id = %conn_id, "Observer has no persisted attachment, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "Failed to load observer attachment");
                    continue;
                }
            };

            if !attachment.filters.matches(event) {
                continue;
            }

            let json = match formatter::format(event, attachment.filters.session_id)
                .and_then(|wire| serde_json::to_string(&wire).map_err(Into::into))
            {
                Ok(json) => json,
                Err(e) => {
                    warn!(conn_id = %conn_id, event_id = event.id, error = %e, "Failed to format event");
                    continue;
                }
            };

            if conn.send_text(json) {
                delivered += 1;
            } else {
                debug!(conn_id = %conn_id, event_id = event.id, "Send failed, connection stale");
            }
        }

        delivered
    }
}
