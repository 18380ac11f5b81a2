//! Replay - Byte-budgeted history catch-up for new observers.
//!
//! History can be large and fast-growing, so replay never holds more than
//! one round's worth of serialized output: each round opens a fresh store
//! cursor at the last delivered id, sends until the byte budget is spent,
//! then abandons the cursor. The query setup is re-paid per round, which
//! is the price of bounding memory.

use std::sync::Arc;

use beacon_store::{EventFilter, EventStore};
use futures::TryStreamExt;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::formatter;
use crate::sink::ConnectionHandle;

/// Per-round serialized-output budget, in bytes.
pub const ROUND_BYTE_BUDGET: usize = 1_048_576;

/// Counters for one replay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Events delivered
    pub events_sent: usize,
    /// Store cursors opened, including the final empty round
    pub rounds: usize,
    /// Serialized bytes pushed to the connection
    pub bytes_sent: usize,
}

/// Drives the catch-up read when an observer connects.
pub struct ReplayEngine {
    store: Arc<dyn EventStore>,
    round_byte_budget: usize,
}

impl ReplayEngine {
    /// Create an engine with the default round budget.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            round_byte_budget: ROUND_BYTE_BUDGET,
        }
    }

    /// Override the per-round byte budget.
    #[must_use]
    pub fn with_round_budget(mut self, bytes: usize) -> Self {
        self.round_byte_budget = bytes;
        self
    }

    /// Replay all history matching `filters` to the connection, in
    /// ascending event-id order.
    ///
    /// Stops without touching the store once the connection is gone. A
    /// store or formatting failure aborts the run; the caller is
    /// responsible for surfacing it as a single internal-error envelope.
    #[instrument(skip(self, filters, conn), fields(session_id = %filters.session_id, conn_id = %conn.id()))]
    pub async fn run(&self, filters: &EventFilter, conn: &ConnectionHandle) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        let mut cursor = filters.from_id;

        loop {
            if !conn.is_open() {
                debug!("Connection gone, abandoning replay");
                return Ok(stats);
            }

            let mut round_filter = filters.clone();
            round_filter.from_id = cursor;

            let mut stream = self.store.scan(&round_filter);
            let mut round_events = 0usize;
            let mut round_bytes = 0usize;
            stats.rounds += 1;

            while let Some(event) = stream.try_next().await? {
                let wire = formatter::format(&event, filters.session_id)?;
                let json = serde_json::to_string(&wire)?;
                let frame_len = json.len();

                if !conn.send_text(json) {
                    debug!("Connection gone mid-round, abandoning replay");
                    return Ok(stats);
                }

                round_bytes += frame_len;
                cursor = Some(event.id);
                round_events += 1;
                stats.events_sent += 1;
                stats.bytes_sent += frame_len;
                // Budget check comes after the send so a single oversized
                // event still makes progress.
                if round_bytes >= self.round_byte_budget {
                    break;
                }
            }
            drop(stream);

            if round_events == 0 {
                debug!(
                    events = stats.events_sent,
                    rounds = stats.rounds,
                    "Replay complete"
                );
                return Ok(stats);
            }
        }
    }
}
