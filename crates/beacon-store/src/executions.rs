//! Executions - Execution lifecycle records
//!
//! The registry is the relay's collaborator for authoritative execution
//! state: status transitions, captured metadata and heartbeat tracking.
//! Callers are expected to re-read status before applying a terminal
//! transition; `update_status` itself refuses to overwrite a terminal row.

use chrono::TimeZone;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{Execution, ExecutionStatus};

/// Trait for execution state backends.
#[async_trait::async_trait]
pub trait ExecutionRegistry: Send + Sync {
    /// Create a new execution record
    async fn create(&self, execution: &Execution) -> Result<()>;

    /// Get an execution by id
    async fn get(&self, id: Uuid) -> Result<Option<Execution>>;

    /// Transition the execution status.
    ///
    /// Terminal rows are left untouched; the transition is silently skipped
    /// so retried or out-of-order events cannot clobber a recorded outcome.
    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        exit_code: Option<i64>,
    ) -> Result<()>;

    /// Record the git branch reported by the worker
    async fn set_branch(&self, id: Uuid, branch: &str) -> Result<()>;

    /// Link the external agent session id captured from the event stream
    async fn link_agent_session(&self, id: Uuid, agent_session_id: &str) -> Result<()>;

    /// Refresh the worker-liveness timestamp
    async fn record_heartbeat(&self, id: Uuid) -> Result<()>;
}

/// Execution registry backed by SQLite.
#[derive(Clone)]
pub struct SqliteExecutionRegistry {
    pool: SqlitePool,
}

impl SqliteExecutionRegistry {
    /// Create a new registry on the given connection pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the executions table if it does not exist.
    pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                ingest_token TEXT NOT NULL,
                branch TEXT,
                agent_session_id TEXT,
                error TEXT,
                exit_code INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                completed_at_ms INTEGER,
                last_heartbeat_at_ms INTEGER
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_session ON executions (session_id)",
        )
        .execute(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    fn row_to_execution(row: SqliteRow) -> Result<Execution> {
        let id: String = row.get("id");
        let session_id: String = row.get("session_id");
        let status_str: String = row.get("status");
        let status: ExecutionStatus = status_str
            .parse()
            .map_err(|e: String| Error::Serialization(e))?;

        let ms = |column: &str| -> Result<DateTime<Utc>> {
            let value: i64 = row.get(column);
            Utc.timestamp_millis_opt(value)
                .single()
                .ok_or_else(|| Error::Serialization(format!("bad timestamp in {column}")))
        };
        let opt_ms = |column: &str| -> Result<Option<DateTime<Utc>>> {
            let value: Option<i64> = row.get(column);
            value
                .map(|v| {
                    Utc.timestamp_millis_opt(v)
                        .single()
                        .ok_or_else(|| Error::Serialization(format!("bad timestamp in {column}")))
                })
                .transpose()
        };

        Ok(Execution {
            id: Uuid::parse_str(&id).map_err(|e| Error::Serialization(e.to_string()))?,
            session_id: Uuid::parse_str(&session_id)
                .map_err(|e| Error::Serialization(e.to_string()))?,
            status,
            ingest_token: row.get("ingest_token"),
            branch: row.get("branch"),
            agent_session_id: row.get("agent_session_id"),
            error: row.get("error"),
            exit_code: row.get("exit_code"),
            created_at: ms("created_at_ms")?,
            updated_at: ms("updated_at_ms")?,
            completed_at: opt_ms("completed_at_ms")?,
            last_heartbeat_at: opt_ms("last_heartbeat_at_ms")?,
        })
    }
}

#[async_trait::async_trait]
impl ExecutionRegistry for SqliteExecutionRegistry {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, session_id, status, ingest_token, branch, agent_session_id,
                error, exit_code, created_at_ms, updated_at_ms, completed_at_ms,
                last_heartbeat_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.session_id.to_string())
        .bind(execution.status.as_str())
        .bind(&execution.ingest_token)
        .bind(&execution.branch)
        .bind(&execution.agent_session_id)
        .bind(&execution.error)
        .bind(execution.exit_code)
        .bind(execution.created_at.timestamp_millis())
        .bind(execution.updated_at.timestamp_millis())
        .bind(execution.completed_at.map(|t| t.timestamp_millis()))
        .bind(execution.last_heartbeat_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        debug!("Created execution");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.map(Self::row_to_execution).transpose()
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        exit_code: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let completed_at = status.is_terminal().then_some(now);

        // The WHERE clause keeps terminal rows immutable even if a caller
        // races past its own read-before-write check.
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?2,
                error = COALESCE(?3, error),
                exit_code = COALESCE(?4, exit_code),
                completed_at_ms = COALESCE(?5, completed_at_ms),
                updated_at_ms = ?6
            WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'interrupted')
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(error)
        .bind(exit_code)
        .bind(completed_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            debug!(execution_id = %id, status = %status, "Status transition skipped");
        } else {
            debug!(execution_id = %id, status = %status, "Updated execution status");
        }
        Ok(())
    }

    async fn set_branch(&self, id: Uuid, branch: &str) -> Result<()> {
        sqlx::query("UPDATE executions SET branch = ?2, updated_at_ms = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(branch)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn link_agent_session(&self, id: Uuid, agent_session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE executions SET agent_session_id = ?2, updated_at_ms = ?3 WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(agent_session_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_heartbeat(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE executions SET last_heartbeat_at_ms = ?2, updated_at_ms = ?2 WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

/// In-memory execution registry, used in tests and embedded setups.
#[derive(Clone, Default)]
pub struct MemoryExecutionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Execution>>>,
}

impl MemoryExecutionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ExecutionRegistry for MemoryExecutionRegistry {
    async fn create(&self, execution: &Execution) -> Result<()> {
        let mut map = self.inner.lock().expect("registry poisoned");
        map.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        let map = self.inner.lock().expect("registry poisoned");
        Ok(map.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        exit_code: Option<i64>,
    ) -> Result<()> {
        let mut map = self.inner.lock().expect("registry poisoned");
        let execution = map
            .get_mut(&id)
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;
        if execution.status.is_terminal() {
            debug!(execution_id = %id, status = %status, "Status transition skipped");
            return Ok(());
        }
        let now = Utc::now();
        execution.status = status;
        if let Some(error) = error {
            execution.error = Some(error.to_string());
        }
        if let Some(code) = exit_code {
            execution.exit_code = Some(code);
        }
        if status.is_terminal() {
            execution.completed_at = Some(now);
        }
        execution.updated_at = now;
        Ok(())
    }

    async fn set_branch(&self, id: Uuid, branch: &str) -> Result<()> {
        let mut map = self.inner.lock().expect("registry poisoned");
        let execution = map
            .get_mut(&id)
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;
        execution.branch = Some(branch.to_string());
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn link_agent_session(&self, id: Uuid, agent_session_id: &str) -> Result<()> {
        let mut map = self.inner.lock().expect("registry poisoned");
        let execution = map
            .get_mut(&id)
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;
        execution.agent_session_id = Some(agent_session_id.to_string());
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn record_heartbeat(&self, id: Uuid) -> Result<()> {
        let mut map = self.inner.lock().expect("registry poisoned");
        let execution = map
            .get_mut(&id)
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;
        let now = Utc::now();
        execution.last_heartbeat_at = Some(now);
        execution.updated_at = now;
        Ok(())
    }
}
