//! Attachments - Durable per-connection metadata
//!
//! The relay actor may be evicted from memory between messages; anything it
//! needs across messages (observer filters, capture flags, the heartbeat
//! clock) is written through here, keyed by connection id, and re-read
//! before use instead of trusted from a local cache.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::EventFilter;

/// Metadata bound to an observer connection. Immutable after accept.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ObserverAttachment {
    /// The observer's filters, fixed for the connection's lifetime
    pub filters: EventFilter,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
}

/// Metadata bound to the single worker connection of an execution.
///
/// Mutated in place as side effects occur and re-persisted after each
/// mutation; the in-memory copy is not authoritative across evictions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestAttachment {
    /// Execution the worker is streaming for
    pub execution_id: Uuid,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
    /// Whether the external agent session id has been captured
    pub agent_session_captured: bool,
    /// The captured agent session id, once seen
    pub agent_session_id: Option<String>,
    /// Last time the debounced heartbeat was written through
    pub last_heartbeat_update: DateTime<Utc>,
}

impl IngestAttachment {
    /// Fresh attachment for a newly accepted worker connection
    #[must_use]
    pub fn new(execution_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            connected_at: now,
            agent_session_captured: false,
            agent_session_id: None,
            last_heartbeat_update: now,
        }
    }
}

/// Trait for per-connection attachment storage backends.
#[async_trait::async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Persist an observer attachment
    async fn put_observer(&self, conn_id: Uuid, attachment: &ObserverAttachment) -> Result<()>;

    /// Load an observer attachment
    async fn observer(&self, conn_id: Uuid) -> Result<Option<ObserverAttachment>>;

    /// Persist an ingest attachment
    async fn put_ingest(&self, conn_id: Uuid, attachment: &IngestAttachment) -> Result<()>;

    /// Load an ingest attachment
    async fn ingest(&self, conn_id: Uuid) -> Result<Option<IngestAttachment>>;

    /// Remove whatever attachment is stored for a connection
    async fn remove(&self, conn_id: Uuid) -> Result<()>;
}

const KIND_OBSERVER: &str = "observer";
const KIND_INGEST: &str = "ingest";

/// Attachment store backed by SQLite; attachments are JSON rows keyed by
/// connection id.
#[derive(Clone)]
pub struct SqliteAttachmentStore {
    pool: SqlitePool,
}

impl SqliteAttachmentStore {
    /// Create a new attachment store on the given connection pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the attachments table if it does not exist.
    pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachments (
                conn_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn put(&self, conn_id: Uuid, kind: &str, data: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attachments (conn_id, kind, data, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (conn_id) DO UPDATE SET kind = ?2, data = ?3, updated_at_ms = ?4
            "#,
        )
        .bind(conn_id.to_string())
        .bind(kind)
        .bind(data)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, conn_id: Uuid, kind: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT data FROM attachments WHERE conn_id = ?1 AND kind = ?2")
            .bind(conn_id.to_string())
            .bind(kind)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.map(|r| r.get("data")))
    }
}

#[async_trait::async_trait]
impl AttachmentStore for SqliteAttachmentStore {
    async fn put_observer(&self, conn_id: Uuid, attachment: &ObserverAttachment) -> Result<()> {
        let data = serde_json::to_string(attachment)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.put(conn_id, KIND_OBSERVER, data).await
    }

    async fn observer(&self, conn_id: Uuid) -> Result<Option<ObserverAttachment>> {
        self.get(conn_id, KIND_OBSERVER)
            .await?
            .map(|data| {
                serde_json::from_str(&data).map_err(|e| Error::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn put_ingest(&self, conn_id: Uuid, attachment: &IngestAttachment) -> Result<()> {
        let data = serde_json::to_string(attachment)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.put(conn_id, KIND_INGEST, data).await
    }

    async fn ingest(&self, conn_id: Uuid) -> Result<Option<IngestAttachment>> {
        self.get(conn_id, KIND_INGEST)
            .await?
            .map(|data| {
                serde_json::from_str(&data).map_err(|e| Error::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn remove(&self, conn_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM attachments WHERE conn_id = ?1")
            .bind(conn_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

/// In-memory attachment store, used in tests and embedded setups.
#[derive(Clone, Default)]
pub struct MemoryAttachmentStore {
    inner: Arc<Mutex<HashMap<Uuid, StoredAttachment>>>,
}

#[derive(Clone)]
enum StoredAttachment {
    Observer(ObserverAttachment),
    Ingest(IngestAttachment),
}

impl MemoryAttachmentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn put_observer(&self, conn_id: Uuid, attachment: &ObserverAttachment) -> Result<()> {
        let mut map = self.inner.lock().expect("attachment store poisoned");
        map.insert(conn_id, StoredAttachment::Observer(attachment.clone()));
        Ok(())
    }

    async fn observer(&self, conn_id: Uuid) -> Result<Option<ObserverAttachment>> {
        let map = self.inner.lock().expect("attachment store poisoned");
        Ok(match map.get(&conn_id) {
            Some(StoredAttachment::Observer(att)) => Some(att.clone()),
            _ => None,
        })
    }

    async fn put_ingest(&self, conn_id: Uuid, attachment: &IngestAttachment) -> Result<()> {
        let mut map = self.inner.lock().expect("attachment store poisoned");
        map.insert(conn_id, StoredAttachment::Ingest(attachment.clone()));
        Ok(())
    }

    async fn ingest(&self, conn_id: Uuid) -> Result<Option<IngestAttachment>> {
        let map = self.inner.lock().expect("attachment store poisoned");
        Ok(match map.get(&conn_id) {
            Some(StoredAttachment::Ingest(att)) => Some(att.clone()),
            _ => None,
        })
    }

    async fn remove(&self, conn_id: Uuid) -> Result<()> {
        let mut map = self.inner.lock().expect("attachment store poisoned");
        map.remove(&conn_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite_store() -> SqliteAttachmentStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteAttachmentStore::ensure_schema(&pool).await.unwrap();
        SqliteAttachmentStore::new(pool)
    }

    #[tokio::test]
    async fn test_observer_roundtrip() {
        let store = sqlite_store().await;
        let conn_id = Uuid::new_v4();
        let attachment = ObserverAttachment {
            filters: EventFilter::session(Uuid::new_v4()).with_from_id(12),
            connected_at: Utc::now(),
        };

        store.put_observer(conn_id, &attachment).await.unwrap();
        let loaded = store.observer(conn_id).await.unwrap().unwrap();
        assert_eq!(loaded.filters.from_id, Some(12));
        assert_eq!(loaded.filters.session_id, attachment.filters.session_id);
    }

    #[tokio::test]
    async fn test_ingest_mutation_persists() {
        let store = sqlite_store().await;
        let conn_id = Uuid::new_v4();
        let mut attachment = IngestAttachment::new(Uuid::new_v4(), Utc::now());

        store.put_ingest(conn_id, &attachment).await.unwrap();

        attachment.agent_session_captured = true;
        attachment.agent_session_id = Some("agent-7".to_string());
        store.put_ingest(conn_id, &attachment).await.unwrap();

        let loaded = store.ingest(conn_id).await.unwrap().unwrap();
        assert!(loaded.agent_session_captured);
        assert_eq!(loaded.agent_session_id.as_deref(), Some("agent-7"));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_none() {
        let store = sqlite_store().await;
        let conn_id = Uuid::new_v4();
        let attachment = IngestAttachment::new(Uuid::new_v4(), Utc::now());
        store.put_ingest(conn_id, &attachment).await.unwrap();

        assert!(store.observer(conn_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryAttachmentStore::new();
        let conn_id = Uuid::new_v4();
        let attachment = IngestAttachment::new(Uuid::new_v4(), Utc::now());
        store.put_ingest(conn_id, &attachment).await.unwrap();
        store.remove(conn_id).await.unwrap();
        assert!(store.ingest(conn_id).await.unwrap().is_none());
    }
}
