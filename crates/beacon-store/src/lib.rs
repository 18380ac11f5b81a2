//! Beacon Store - Storage layer for the event relay
//!
//! This crate provides the durable state the relay core depends on:
//! - Event: stored event records and query filters
//! - Store: the append-only per-session event log (SQLite or in-memory)
//! - Executions: execution lifecycle records and the registry trait
//! - Attachments: per-connection metadata that survives actor eviction

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attachments;
pub mod error;
pub mod event;
pub mod executions;
pub mod store;

pub use attachments::{
    AttachmentStore, IngestAttachment, MemoryAttachmentStore, ObserverAttachment,
    SqliteAttachmentStore,
};
pub use error::{Error, Result};
pub use event::{EventFilter, Execution, ExecutionStatus, NewEvent, StoredEvent};
pub use executions::{ExecutionRegistry, MemoryExecutionRegistry, SqliteExecutionRegistry};
pub use store::{EventStore, MemoryEventStore, SqliteEventStore};

/// Create all Beacon tables on the given pool if they do not exist yet.
pub async fn init_schema(pool: &sqlx::SqlitePool) -> Result<()> {
    store::SqliteEventStore::ensure_schema(pool).await?;
    executions::SqliteExecutionRegistry::ensure_schema(pool).await?;
    attachments::SqliteAttachmentStore::ensure_schema(pool).await?;
    Ok(())
}
