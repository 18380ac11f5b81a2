//! Store - The append-only per-session event log
//!
//! Events are keyed by a store-assigned, strictly increasing id. The log is
//! queryable by a cursor (`from_id`) and by composite filters, both as a lazy
//! forward cursor (`scan`) and as a bounded-count fetch (`fetch`).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::TimeZone;
use chrono::Utc;
use futures::stream::BoxStream;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::event::{EventFilter, NewEvent, StoredEvent};

/// Page size used by the default `scan` implementation.
const SCAN_PAGE: u32 = 256;

/// Trait for event log backends.
///
/// This trait allows different storage implementations (SQLite, in-memory,
/// etc.) to be used interchangeably.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event; the store assigns the id.
    async fn insert(&self, event: NewEvent) -> Result<StoredEvent>;

    /// Fetch up to `limit` matching events in ascending id order.
    async fn fetch(&self, filter: &EventFilter, limit: u32) -> Result<Vec<StoredEvent>>;

    /// Lazy forward cursor over matching events in ascending id order.
    ///
    /// The stream reads the log incrementally and may be dropped at any
    /// point without consuming the remainder.
    fn scan<'a>(&'a self, filter: &EventFilter) -> BoxStream<'a, Result<StoredEvent>> {
        struct ScanState {
            filter: EventFilter,
            buffer: VecDeque<StoredEvent>,
            exhausted: bool,
        }

        let state = ScanState {
            filter: filter.clone(),
            buffer: VecDeque::new(),
            exhausted: false,
        };

        Box::pin(futures::stream::try_unfold(state, move |mut state| async move {
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }
                let page = self.fetch(&state.filter, SCAN_PAGE).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                if (page.len() as u32) < SCAN_PAGE {
                    state.exhausted = true;
                }
                state.filter.from_id = page.last().map(|e| e.id);
                state.buffer.extend(page);
            }
        }))
    }
}

/// Event log backed by SQLite.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Create a new event store on the given connection pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the events table and indexes if they do not exist.
    pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_session ON events (session_id, id)",
        )
        .execute(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    fn row_to_event(row: SqliteRow) -> Result<StoredEvent> {
        let session_id: String = row.get("session_id");
        let execution_id: String = row.get("execution_id");
        let timestamp_ms: i64 = row.get("timestamp_ms");

        let timestamp = Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .ok_or_else(|| Error::Serialization(format!("bad timestamp: {timestamp_ms}")))?;

        Ok(StoredEvent {
            id: row.get("id"),
            session_id: uuid::Uuid::parse_str(&session_id)
                .map_err(|e| Error::Serialization(e.to_string()))?,
            execution_id: uuid::Uuid::parse_str(&execution_id)
                .map_err(|e| Error::Serialization(e.to_string()))?,
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            timestamp,
        })
    }
}

#[async_trait::async_trait]
impl EventStore for SqliteEventStore {
    #[instrument(skip(self, event), fields(execution_id = %event.execution_id, event_type = %event.event_type))]
    async fn insert(&self, event: NewEvent) -> Result<StoredEvent> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (session_id, execution_id, event_type, payload, timestamp_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(event.session_id.to_string())
        .bind(event.execution_id.to_string())
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let id = result.last_insert_rowid();
        debug!(event_id = id, "Appended event");

        Ok(StoredEvent {
            id,
            execution_id: event.execution_id,
            session_id: event.session_id,
            event_type: event.event_type,
            payload: event.payload,
            timestamp: event.timestamp,
        })
    }

    #[instrument(skip(self, filter), fields(session_id = %filter.session_id))]
    async fn fetch(&self, filter: &EventFilter, limit: u32) -> Result<Vec<StoredEvent>> {
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT id, session_id, execution_id, event_type, payload, timestamp_ms \
             FROM events WHERE session_id = ",
        );
        qb.push_bind(filter.session_id.to_string());

        if let Some(from_id) = filter.from_id {
            qb.push(" AND id > ");
            qb.push_bind(from_id);
        }
        if let Some(ids) = &filter.execution_ids {
            if ids.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND execution_id IN (");
                {
                    let mut sep = qb.separated(", ");
                    for id in ids {
                        sep.push_bind(id.to_string());
                    }
                }
                qb.push(")");
            }
        }
        if let Some(types) = &filter.event_types {
            if types.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND event_type IN (");
                {
                    let mut sep = qb.separated(", ");
                    for event_type in types {
                        sep.push_bind(event_type.clone());
                    }
                }
                qb.push(")");
            }
        }
        if let Some(start) = filter.start_time {
            qb.push(" AND timestamp_ms >= ");
            qb.push_bind(start.timestamp_millis());
        }
        if let Some(end) = filter.end_time {
            qb.push(" AND timestamp_ms <= ");
            qb.push_bind(end.timestamp_millis());
        }
        qb.push(" ORDER BY id ASC LIMIT ");
        qb.push_bind(i64::from(limit));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(Self::row_to_event).collect()
    }
}

/// In-memory event log, used in tests and embedded setups.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<Mutex<MemoryLog>>,
}

#[derive(Default)]
struct MemoryLog {
    next_id: i64,
    events: Vec<StoredEvent>,
}

impl MemoryEventStore {
    /// Create an empty in-memory log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: NewEvent) -> Result<StoredEvent> {
        let mut log = self.inner.lock().expect("event log poisoned");
        log.next_id += 1;
        let stored = StoredEvent {
            id: log.next_id,
            execution_id: event.execution_id,
            session_id: event.session_id,
            event_type: event.event_type,
            payload: event.payload,
            timestamp: event.timestamp,
        };
        log.events.push(stored.clone());
        Ok(stored)
    }

    async fn fetch(&self, filter: &EventFilter, limit: u32) -> Result<Vec<StoredEvent>> {
        let log = self.inner.lock().expect("event log poisoned");
        let from_id = filter.from_id.unwrap_or(0);
        Ok(log
            .events
            .iter()
            .filter(|e| e.id > from_id && filter.matches(e))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
