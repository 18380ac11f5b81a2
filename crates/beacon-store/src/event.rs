//! Event - Stored event records, query filters and execution lifecycle types
//!
//! Events form an immutable, ordered per-session log. The store assigns each
//! event a strictly increasing id which replay cursors and catch-up reads are
//! keyed on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Execution created, worker not yet connected
    Pending,
    /// Worker connected and streaming events
    Running,
    /// Worker finished successfully
    Completed,
    /// Worker hit a fatal error
    Failed,
    /// Execution was interrupted
    Interrupted,
}

impl ExecutionStatus {
    /// Returns the string representation of the status
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    /// Check if the execution is terminal (completed, failed, or interrupted).
    ///
    /// Once terminal, no further lifecycle transition is permitted.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "interrupted" => Ok(Self::Interrupted),
            _ => Err(format!("unknown execution status: {s}")),
        }
    }
}

/// One run of the worker, with its own status lifecycle and ingest token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier
    pub id: Uuid,

    /// Session this execution belongs to
    pub session_id: Uuid,

    /// Current lifecycle status
    pub status: ExecutionStatus,

    /// One-time token the worker presents when connecting to ingest
    pub ingest_token: String,

    /// Git branch captured from the worker's completion event
    pub branch: Option<String>,

    /// External agent session id captured from the event stream
    pub agent_session_id: Option<String>,

    /// Failure or interruption reason (terminal statuses only)
    pub error: Option<String>,

    /// Worker exit code, when reported
    pub exit_code: Option<i64>,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// When the record was last updated
    pub updated_at: DateTime<Utc>,

    /// When a terminal status was reached
    pub completed_at: Option<DateTime<Utc>>,

    /// Last time the worker connection was seen alive
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Create a new pending execution
    #[must_use]
    pub fn new(session_id: Uuid, ingest_token: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            status: ExecutionStatus::Pending,
            ingest_token: ingest_token.into(),
            branch: None,
            agent_session_id: None,
            error: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_heartbeat_at: None,
        }
    }
}

/// An event record as returned by the store. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Store-assigned id, strictly increasing within the session log
    pub id: i64,

    /// Execution the event belongs to
    pub execution_id: Uuid,

    /// Session log the event was appended to
    pub session_id: Uuid,

    /// Wire event type (e.g. `log`, `complete`, `heartbeat`)
    pub event_type: String,

    /// Serialized JSON payload
    pub payload: String,

    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

/// An event about to be appended; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Execution the event belongs to
    pub execution_id: Uuid,
    /// Session log to append to
    pub session_id: Uuid,
    /// Wire event type
    pub event_type: String,
    /// Serialized JSON payload
    pub payload: String,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    /// Create a new event with a JSON payload
    #[must_use]
    pub fn new(
        execution_id: Uuid,
        session_id: Uuid,
        event_type: impl Into<String>,
        payload: &serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            session_id,
            event_type: event_type.into(),
            payload: payload.to_string(),
            timestamp,
        }
    }
}

/// Composite event filter, used both as the store query shape and as the
/// live-broadcast matching predicate.
///
/// All present constraints must hold; absent constraints match anything.
/// `from_id` is a replay cursor and only applies to catch-up reads, not to
/// live matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    /// Session log to read; fixed per relay instance
    pub session_id: Uuid,

    /// Only events with id strictly greater than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<i64>,

    /// Restrict to these executions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ids: Option<Vec<Uuid>>,

    /// Restrict to these event types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,

    /// Only events at or after this instant (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Only events at or before this instant (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Filter matching every event in a session log
    #[must_use]
    pub fn session(session_id: Uuid) -> Self {
        Self {
            session_id,
            from_id: None,
            execution_ids: None,
            event_types: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Set the replay cursor
    #[must_use]
    pub fn with_from_id(mut self, from_id: i64) -> Self {
        self.from_id = Some(from_id);
        self
    }

    /// Restrict to a set of executions
    #[must_use]
    pub fn for_executions(mut self, execution_ids: Vec<Uuid>) -> Self {
        self.execution_ids = Some(execution_ids);
        self
    }

    /// Restrict to a set of event types
    #[must_use]
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Restrict to a time window (either bound may be open)
    #[must_use]
    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    /// Live-broadcast predicate: does this event satisfy every present
    /// constraint? Time bounds are inclusive on both ends, mirroring the
    /// store's range comparison.
    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if event.session_id != self.session_id {
            return false;
        }
        if let Some(ids) = &self.execution_ids {
            if !ids.contains(&event.execution_id) {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if event.timestamp > end {
                return false;
            }
        }
        true
    }
}
