//! Lifecycle - Side effects derived from the event stream.
//!
//! Applied after an event is already persisted and broadcast: losing a
//! side effect to a bad payload must never lose the event itself, so
//! validation failures here are logged and skipped, never surfaced to the
//! worker.

use std::sync::Arc;

use beacon_store::{AttachmentStore, ExecutionRegistry, ExecutionStatus, StoredEvent};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{
    CompletePayload, EventKind, FatalErrorPayload, InterruptedPayload, KilocodePayload,
    DEFAULT_FATAL_MESSAGE, DEFAULT_INTERRUPT_REASON,
};

/// Interprets lifecycle-bearing events and mutates execution state.
pub struct LifecycleCoordinator {
    executions: Arc<dyn ExecutionRegistry>,
    attachments: Arc<dyn AttachmentStore>,
}

impl LifecycleCoordinator {
    /// Create a coordinator over the given collaborators.
    #[must_use]
    pub fn new(
        executions: Arc<dyn ExecutionRegistry>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        Self {
            executions,
            attachments,
        }
    }

    /// Apply whatever side effect the event implies, if any.
    ///
    /// `conn_id` identifies the ingest connection the event arrived on;
    /// agent-session capture state is tracked on its attachment.
    pub async fn apply(&self, conn_id: Uuid, event: &StoredEvent) -> Result<()> {
        match EventKind::of(&event.event_type) {
            EventKind::Kilocode => self.capture_agent_session(conn_id, event).await,
            EventKind::Complete => self.complete(event).await,
            EventKind::Interrupted => self.interrupt(event).await,
            EventKind::Error => self.fail(event).await,
            EventKind::Other => Ok(()),
        }
    }

    /// Re-read the current status right before a transition. Events may be
    /// retried or arrive out of order; a terminal status is never
    /// overwritten.
    async fn is_terminal(&self, execution_id: Uuid) -> Result<bool> {
        match self.executions.get(execution_id).await? {
            Some(execution) => {
                if execution.status.is_terminal() {
                    debug!(execution_id = %execution_id, status = %execution.status, "Already terminal, skipping transition");
                    return Ok(true);
                }
                Ok(false)
            }
            None => {
                warn!(execution_id = %execution_id, "Execution missing, skipping transition");
                Ok(true)
            }
        }
    }

    async fn capture_agent_session(&self, conn_id: Uuid, event: &StoredEvent) -> Result<()> {
        let payload: KilocodePayload = match serde_json::from_str(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = event.id, error = %e, "Invalid kilocode payload, skipping");
                return Ok(());
            }
        };
        let Some(agent_session_id) = payload.session_id else {
            debug!(event_id = event.id, "kilocode event without session id");
            return Ok(());
        };

        let Some(mut attachment) = self.attachments.ingest(conn_id).await? else {
            warn!(conn_id = %conn_id, "No ingest attachment for kilocode event");
            return Ok(());
        };
        if attachment.agent_session_captured {
            return Ok(());
        }

        self.executions
            .link_agent_session(event.execution_id, &agent_session_id)
            .await?;
        attachment.agent_session_captured = true;
        attachment.agent_session_id = Some(agent_session_id);
        self.attachments.put_ingest(conn_id, &attachment).await?;
        Ok(())
    }

    async fn complete(&self, event: &StoredEvent) -> Result<()> {
        let payload: CompletePayload = match serde_json::from_str(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = event.id, error = %e, "Invalid complete payload, skipping");
                return Ok(());
            }
        };
        if self.is_terminal(event.execution_id).await? {
            return Ok(());
        }

        if let Some(branch) = &payload.current_branch {
            self.executions.set_branch(event.execution_id, branch).await?;
        }
        self.executions
            .update_status(
                event.execution_id,
                ExecutionStatus::Completed,
                None,
                Some(payload.exit_code),
            )
            .await?;
        Ok(())
    }

    async fn interrupt(&self, event: &StoredEvent) -> Result<()> {
        let payload: InterruptedPayload = match serde_json::from_str(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = event.id, error = %e, "Invalid interrupted payload, skipping");
                return Ok(());
            }
        };
        if self.is_terminal(event.execution_id).await? {
            return Ok(());
        }

        let reason = payload
            .reason
            .as_deref()
            .unwrap_or(DEFAULT_INTERRUPT_REASON);
        self.executions
            .update_status(
                event.execution_id,
                ExecutionStatus::Interrupted,
                Some(reason),
                payload.exit_code,
            )
            .await?;
        Ok(())
    }

    async fn fail(&self, event: &StoredEvent) -> Result<()> {
        let payload: FatalErrorPayload = match serde_json::from_str(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = event.id, error = %e, "Invalid error payload, skipping");
                return Ok(());
            }
        };
        if !payload.fatal {
            return Ok(());
        }
        if self.is_terminal(event.execution_id).await? {
            return Ok(());
        }

        let message = payload
            .error
            .as_deref()
            .or(payload.message.as_deref())
            .unwrap_or(DEFAULT_FATAL_MESSAGE);
        self.executions
            .update_status(
                event.execution_id,
                ExecutionStatus::Failed,
                Some(message),
                None,
            )
            .await?;
        Ok(())
    }
}
