//! Session - The per-session actor coordinating ingest and stream sides.
//!
//! At most one handler runs at a time for a given session: commands are
//! processed to completion, in arrival order, by a single task. Different
//! sessions are fully independent. Anything the actor needs across
//! messages lives in the attachment store and is re-read before use; the
//! in-memory connection maps exist only to route frames and detect
//! replacement races.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_store::{
    AttachmentStore, EventFilter, EventStore, Execution, ExecutionRegistry, ExecutionStatus,
    IngestAttachment, NewEvent, ObserverAttachment,
};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::BroadcastRouter;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleCoordinator;
use crate::protocol::{ErrorEnvelope, IngestFrame, CLOSE_NORMAL, REPLACED_REASON};
use crate::replay::{ReplayEngine, ROUND_BYTE_BUDGET};
use crate::sink::ConnectionHandle;

/// Command mailbox depth per session actor.
const MAILBOX_CAPACITY: usize = 256;

/// Why an ingest connection is refused at establishment time.
///
/// These map to HTTP statuses at the endpoint; no connection is
/// established and no attachment is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestRejection {
    /// No execution with the supplied id (404)
    UnknownExecution,
    /// Supplied token does not match the execution's ingest token (401)
    InvalidToken,
    /// Execution is neither pending nor running (409)
    NotAcceptingEvents,
}

/// Validate an ingest connection attempt against stored execution state.
pub fn authorize_ingest(
    execution: Option<&Execution>,
    token: &str,
) -> std::result::Result<(), IngestRejection> {
    let Some(execution) = execution else {
        return Err(IngestRejection::UnknownExecution);
    };
    if execution.ingest_token != token {
        return Err(IngestRejection::InvalidToken);
    }
    match execution.status {
        ExecutionStatus::Pending | ExecutionStatus::Running => Ok(()),
        _ => Err(IngestRejection::NotAcceptingEvents),
    }
}

/// Inbound WebSocket payload kinds the ingest side distinguishes.
#[derive(Debug, Clone)]
pub enum IngestPayload {
    /// A text frame carrying a JSON message
    Text(String),
    /// Any binary frame; rejected with a protocol error
    Binary,
}

/// The storage collaborators a session actor works against.
#[derive(Clone)]
pub struct SessionStores {
    /// Append-only event log
    pub events: Arc<dyn EventStore>,
    /// Execution lifecycle state
    pub executions: Arc<dyn ExecutionRegistry>,
    /// Durable per-connection metadata
    pub attachments: Arc<dyn AttachmentStore>,
}

/// Tunables for a session actor.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Per-round replay byte budget
    pub replay_round_budget: usize,
    /// Minimum interval between heartbeat write-throughs
    pub heartbeat_debounce: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            replay_round_budget: ROUND_BYTE_BUDGET,
            heartbeat_debounce: Duration::from_millis(30_000),
        }
    }
}

enum SessionCommand {
    ObserverConnect {
        conn: ConnectionHandle,
        filters: EventFilter,
        done: oneshot::Sender<()>,
    },
    ObserverClose {
        conn_id: Uuid,
    },
    ObserverCount {
        reply: oneshot::Sender<usize>,
    },
    IngestConnect {
        conn: ConnectionHandle,
        execution_id: Uuid,
        done: oneshot::Sender<()>,
    },
    IngestMessage {
        conn: ConnectionHandle,
        payload: IngestPayload,
    },
    IngestClose {
        conn_id: Uuid,
    },
}

/// Cloneable mailbox handle for one session's actor.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Session this handle addresses
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::SessionUnavailable)
    }

    /// Attach an observer. Resolves once replay has finished and the
    /// connection is part of the live broadcast set.
    pub async fn observer_connect(
        &self,
        conn: ConnectionHandle,
        filters: EventFilter,
    ) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.send(SessionCommand::ObserverConnect {
            conn,
            filters,
            done,
        })
        .await?;
        ack.await.map_err(|_| Error::SessionUnavailable)
    }

    /// Detach an observer connection.
    pub async fn observer_close(&self, conn_id: Uuid) -> Result<()> {
        self.send(SessionCommand::ObserverClose { conn_id }).await
    }

    /// Number of currently attached observers.
    pub async fn observer_count(&self) -> Result<usize> {
        let (reply, count) = oneshot::channel();
        self.send(SessionCommand::ObserverCount { reply }).await?;
        count.await.map_err(|_| Error::SessionUnavailable)
    }

    /// Attach the worker connection for an execution. The caller must have
    /// already passed [`authorize_ingest`].
    pub async fn ingest_connect(&self, conn: ConnectionHandle, execution_id: Uuid) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.send(SessionCommand::IngestConnect {
            conn,
            execution_id,
            done,
        })
        .await?;
        ack.await.map_err(|_| Error::SessionUnavailable)
    }

    /// Hand one inbound worker frame to the actor.
    pub async fn ingest_message(
        &self,
        conn: &ConnectionHandle,
        payload: IngestPayload,
    ) -> Result<()> {
        self.send(SessionCommand::IngestMessage {
            conn: conn.clone(),
            payload,
        })
        .await
    }

    /// Report that a worker connection closed.
    pub async fn ingest_close(&self, conn_id: Uuid) -> Result<()> {
        self.send(SessionCommand::IngestClose { conn_id }).await
    }
}

struct IngestTracking {
    conn: ConnectionHandle,
    execution_id: Uuid,
}

/// The actor task owning one session's relay state.
pub struct SessionActor {
    session_id: Uuid,
    events: Arc<dyn EventStore>,
    executions: Arc<dyn ExecutionRegistry>,
    attachments: Arc<dyn AttachmentStore>,
    replay: ReplayEngine,
    broadcast: BroadcastRouter,
    lifecycle: LifecycleCoordinator,
    heartbeat_debounce: chrono::Duration,
    observers: HashMap<Uuid, ConnectionHandle>,
    ingest: Option<IngestTracking>,
    rx: mpsc::Receiver<SessionCommand>,
}

impl SessionActor {
    /// Spawn the actor task for a session and return its handle.
    #[must_use]
    pub fn spawn(session_id: Uuid, stores: SessionStores, settings: SessionSettings) -> SessionHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let actor = SessionActor {
            session_id,
            events: stores.events.clone(),
            executions: stores.executions.clone(),
            attachments: stores.attachments.clone(),
            replay: ReplayEngine::new(stores.events.clone())
                .with_round_budget(settings.replay_round_budget),
            broadcast: BroadcastRouter::new(stores.attachments.clone()),
            lifecycle: LifecycleCoordinator::new(
                stores.executions.clone(),
                stores.attachments.clone(),
            ),
            heartbeat_debounce: chrono::Duration::from_std(settings.heartbeat_debounce)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(30_000)),
            observers: HashMap::new(),
            ingest: None,
            rx,
        };
        tokio::spawn(actor.run());

        SessionHandle { session_id, tx }
    }

    async fn run(mut self) {
        debug!(session_id = %self.session_id, "Session actor started");
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
        }
        debug!(session_id = %self.session_id, "Session actor stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ObserverConnect {
                conn,
                filters,
                done,
            } => {
                self.on_observer_connect(conn, filters).await;
                let _ = done.send(());
            }
            SessionCommand::ObserverClose { conn_id } => {
                self.on_observer_close(conn_id).await;
            }
            SessionCommand::ObserverCount { reply } => {
                let _ = reply.send(self.observers.len());
            }
            SessionCommand::IngestConnect {
                conn,
                execution_id,
                done,
            } => {
                self.on_ingest_connect(conn, execution_id).await;
                let _ = done.send(());
            }
            SessionCommand::IngestMessage { conn, payload } => {
                // The single failure path: any uncaught error becomes an
                // internal-error envelope, never a closed connection.
                if let Err(e) = self.on_ingest_message(&conn, payload).await {
                    error!(session_id = %self.session_id, conn_id = %conn.id(), error = %e, "Ingest message handling failed");
                    conn.send_error(&ErrorEnvelope::internal(e.to_string()));
                }
            }
            SessionCommand::IngestClose { conn_id } => {
                self.on_ingest_close(conn_id).await;
            }
        }
    }

    async fn on_observer_connect(&mut self, conn: ConnectionHandle, filters: EventFilter) {
        let conn_id = conn.id();
        let attachment = ObserverAttachment {
            filters: filters.clone(),
            connected_at: Utc::now(),
        };

        let caught_up: Result<()> = async {
            self.attachments.put_observer(conn_id, &attachment).await?;
            let stats = self.replay.run(&filters, &conn).await?;
            info!(
                session_id = %self.session_id,
                conn_id = %conn_id,
                events = stats.events_sent,
                rounds = stats.rounds,
                "Observer caught up"
            );
            Ok(())
        }
        .await;

        if let Err(e) = caught_up {
            error!(session_id = %self.session_id, conn_id = %conn_id, error = %e, "Observer replay failed");
            conn.send_error(&ErrorEnvelope::internal("event replay failed"));
        }

        // Live broadcast starts regardless; replay is not retried.
        self.observers.insert(conn_id, conn);
    }

    async fn on_observer_close(&mut self, conn_id: Uuid) {
        if self.observers.remove(&conn_id).is_some() {
            debug!(session_id = %self.session_id, conn_id = %conn_id, "Observer detached");
        }
        if let Err(e) = self.attachments.remove(conn_id).await {
            warn!(conn_id = %conn_id, error = %e, "Failed to remove observer attachment");
        }
    }

    async fn on_ingest_connect(&mut self, conn: ConnectionHandle, execution_id: Uuid) {
        // At most one active ingest connection per execution: the previous
        // one is closed, not negotiated with.
        if let Some(previous) = self.ingest.take() {
            info!(
                session_id = %self.session_id,
                old_conn = %previous.conn.id(),
                new_conn = %conn.id(),
                "Replacing ingest connection"
            );
            previous.conn.close(CLOSE_NORMAL, REPLACED_REASON);
        }

        match self.accept_ingest(&conn, execution_id).await {
            Ok(()) => {
                info!(session_id = %self.session_id, conn_id = %conn.id(), execution_id = %execution_id, "Ingest connection accepted");
                self.ingest = Some(IngestTracking {
                    conn,
                    execution_id,
                });
            }
            Err(e) => {
                error!(session_id = %self.session_id, conn_id = %conn.id(), error = %e, "Ingest accept failed");
                conn.send_error(&ErrorEnvelope::internal(e.to_string()));
            }
        }
    }

    async fn accept_ingest(&self, conn: &ConnectionHandle, execution_id: Uuid) -> Result<()> {
        let execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("execution {execution_id} not found")))?;

        if execution.status == ExecutionStatus::Pending {
            self.executions
                .update_status(execution_id, ExecutionStatus::Running, None, None)
                .await?;
        }

        let attachment = IngestAttachment::new(execution_id, Utc::now());
        self.attachments.put_ingest(conn.id(), &attachment).await?;
        self.executions.record_heartbeat(execution_id).await?;
        Ok(())
    }

    async fn on_ingest_message(
        &mut self,
        conn: &ConnectionHandle,
        payload: IngestPayload,
    ) -> Result<()> {
        let text = match payload {
            IngestPayload::Binary => {
                conn.send_error(&ErrorEnvelope::protocol("binary frames are not supported"));
                return Ok(());
            }
            IngestPayload::Text(text) => text,
        };

        let Some(attachment) = self.attachments.ingest(conn.id()).await? else {
            conn.send_error(&ErrorEnvelope::internal("connection was never accepted"));
            return Ok(());
        };

        let frame: IngestFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                conn.send_error(&ErrorEnvelope::protocol(format!("invalid message: {e}")));
                return Ok(());
            }
        };
        if frame.stream_event_type.is_empty() {
            conn.send_error(&ErrorEnvelope::protocol("streamEventType is required"));
            return Ok(());
        }

        let timestamp = frame
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let data = frame
            .data
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

        // Persist before broadcast: observers must never see an event that
        // failed to land in the log.
        let stored = self
            .events
            .insert(NewEvent::new(
                attachment.execution_id,
                self.session_id,
                frame.stream_event_type.as_str(),
                &data,
                timestamp,
            ))
            .await?;

        let delivered = self.broadcast.dispatch(&stored, &self.observers).await;
        debug!(
            event_id = stored.id,
            event_type = %stored.event_type,
            delivered,
            "Event persisted and broadcast"
        );

        // A superseded connection's in-flight messages are store-and-forward
        // only: no heartbeat, no lifecycle effect.
        let tracked = self
            .ingest
            .as_ref()
            .is_some_and(|t| t.conn.id() == conn.id());
        if !tracked {
            debug!(conn_id = %conn.id(), "Connection superseded, skipping side effects");
            return Ok(());
        }

        let now = Utc::now();
        if now.signed_duration_since(attachment.last_heartbeat_update) >= self.heartbeat_debounce {
            let mut refreshed = attachment.clone();
            refreshed.last_heartbeat_update = now;
            self.attachments.put_ingest(conn.id(), &refreshed).await?;
            self.executions
                .record_heartbeat(attachment.execution_id)
                .await?;
        }

        self.lifecycle.apply(conn.id(), &stored).await?;
        Ok(())
    }

    async fn on_ingest_close(&mut self, conn_id: Uuid) {
        let tracked = self
            .ingest
            .as_ref()
            .is_some_and(|t| t.conn.id() == conn_id);
        if tracked {
            let execution_id = self.ingest.take().map(|t| t.execution_id);
            debug!(session_id = %self.session_id, conn_id = %conn_id, execution_id = ?execution_id, "Ingest connection closed");
        } else {
            // A close from a connection we already replaced must not evict
            // the tracking for its successor.
            debug!(conn_id = %conn_id, "Stale close from superseded connection, ignoring");
        }
        if let Err(e) = self.attachments.remove(conn_id).await {
            warn!(conn_id = %conn_id, error = %e, "Failed to remove ingest attachment");
        }
    }
}

/// Spawns and hands out session actors, one per session id.
#[derive(Clone)]
pub struct SessionRegistry {
    stores: SessionStores,
    settings: SessionSettings,
    sessions: Arc<Mutex<HashMap<Uuid, SessionHandle>>>,
}

impl SessionRegistry {
    /// Create a registry over the given stores.
    #[must_use]
    pub fn new(stores: SessionStores, settings: SessionSettings) -> Self {
        Self {
            stores,
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the actor handle for a session, spawning it on first use.
    #[must_use]
    pub fn handle(&self, session_id: Uuid) -> SessionHandle {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        sessions
            .entry(session_id)
            .or_insert_with(|| SessionActor::spawn(session_id, self.stores.clone(), self.settings))
            .clone()
    }

    /// The storage collaborators this registry wires into actors.
    #[must_use]
    pub fn stores(&self) -> &SessionStores {
        &self.stores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use crate::sink::OutboundFrame;
    use beacon_store::{
        MemoryAttachmentStore, MemoryEventStore, MemoryExecutionRegistry, StoredEvent,
    };

    fn memory_stores() -> SessionStores {
        SessionStores {
            events: Arc::new(MemoryEventStore::new()),
            executions: Arc::new(MemoryExecutionRegistry::new()),
            attachments: Arc::new(MemoryAttachmentStore::new()),
        }
    }

    async fn pending_execution(stores: &SessionStores, session_id: Uuid) -> Execution {
        let execution = Execution::new(session_id, "tok");
        stores.executions.create(&execution).await.unwrap();
        execution
    }

    fn text_frame(event_type: &str, data: serde_json::Value) -> IngestPayload {
        IngestPayload::Text(
            serde_json::json!({"streamEventType": event_type, "data": data}).to_string(),
        )
    }

    /// Round-trip through the mailbox so every previously sent command has
    /// been fully processed.
    async fn fence(handle: &SessionHandle) {
        handle.observer_count().await.unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn texts(frames: &[OutboundFrame]) -> Vec<serde_json::Value> {
        frames
            .iter()
            .filter_map(|f| match f {
                OutboundFrame::Text(json) => Some(serde_json::from_str(json).unwrap()),
                OutboundFrame::Close { .. } => None,
            })
            .collect()
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl EventStore for FailingStore {
        async fn insert(&self, _event: NewEvent) -> beacon_store::Result<StoredEvent> {
            Err(beacon_store::Error::Database("insert failed".to_string()))
        }

        async fn fetch(
            &self,
            _filter: &EventFilter,
            _limit: u32,
        ) -> beacon_store::Result<Vec<StoredEvent>> {
            Err(beacon_store::Error::Database("query failed".to_string()))
        }
    }

    #[tokio::test]
    async fn test_ingest_connect_marks_running_and_heartbeats() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let execution = pending_execution(&stores, session_id).await;
        let handle = SessionActor::spawn(session_id, stores.clone(), SessionSettings::default());

        let (conn, _rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle.ingest_connect(conn.clone(), execution.id).await.unwrap();

        let loaded = stores.executions.get(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert!(loaded.last_heartbeat_at.is_some());

        let attachment = stores.attachments.ingest(conn.id()).await.unwrap().unwrap();
        assert_eq!(attachment.execution_id, execution.id);
        assert!(!attachment.agent_session_captured);
    }

    #[tokio::test]
    async fn test_live_event_reaches_matching_observer() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let execution = pending_execution(&stores, session_id).await;
        let handle = SessionActor::spawn(session_id, stores.clone(), SessionSettings::default());

        let (observer, mut obs_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle
            .observer_connect(observer, EventFilter::session(session_id))
            .await
            .unwrap();

        let (worker, _worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle.ingest_connect(worker.clone(), execution.id).await.unwrap();
        handle
            .ingest_message(&worker, text_frame("log", serde_json::json!({"line": "hi"})))
            .await
            .unwrap();
        fence(&handle).await;

        let events = texts(&drain(&mut obs_rx));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["streamEventType"], "log");
        assert_eq!(events[0]["data"]["line"], "hi");
        assert_eq!(events[0]["executionId"], execution.id.to_string());

        // The event is durable, not just broadcast.
        let stored = stores
            .events
            .fetch(&EventFilter::session(session_id), 10)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_observer_gets_history_then_live() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let execution = pending_execution(&stores, session_id).await;
        let handle = SessionActor::spawn(session_id, stores.clone(), SessionSettings::default());

        let (worker, _worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle.ingest_connect(worker.clone(), execution.id).await.unwrap();
        for i in 0..3 {
            handle
                .ingest_message(&worker, text_frame("log", serde_json::json!({"n": i})))
                .await
                .unwrap();
        }
        fence(&handle).await;

        let (observer, mut obs_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle
            .observer_connect(observer, EventFilter::session(session_id))
            .await
            .unwrap();

        handle
            .ingest_message(&worker, text_frame("log", serde_json::json!({"n": 3})))
            .await
            .unwrap();
        fence(&handle).await;

        let events = texts(&drain(&mut obs_rx));
        assert_eq!(events.len(), 4);
        let ids: Vec<i64> = events.iter().map(|e| e["eventId"].as_i64().unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_second_ingest_connection_replaces_first() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let execution = pending_execution(&stores, session_id).await;
        let handle = SessionActor::spawn(session_id, stores.clone(), SessionSettings::default());

        let (first, mut first_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle.ingest_connect(first.clone(), execution.id).await.unwrap();
        let (second, _second_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle.ingest_connect(second.clone(), execution.id).await.unwrap();

        let frames = drain(&mut first_rx);
        assert!(frames.contains(&OutboundFrame::Close {
            code: CLOSE_NORMAL,
            reason: REPLACED_REASON.to_string(),
        }));

        // In-flight message from the superseded connection: persisted and
        // broadcast, but no lifecycle effect.
        handle
            .ingest_message(&first, text_frame("complete", serde_json::json!({"exitCode": 0})))
            .await
            .unwrap();
        fence(&handle).await;

        let loaded = stores.executions.get(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        let stored = stores
            .events
            .fetch(&EventFilter::session(session_id), 10)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);

        // The stale close must not evict the replacement's tracking.
        handle.ingest_close(first.id()).await.unwrap();
        handle
            .ingest_message(&second, text_frame("complete", serde_json::json!({"exitCode": 0})))
            .await
            .unwrap();
        fence(&handle).await;

        let loaded = stores.executions.get(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_replay_failure_surfaces_one_internal_error() {
        let stores = SessionStores {
            events: Arc::new(FailingStore),
            executions: Arc::new(MemoryExecutionRegistry::new()),
            attachments: Arc::new(MemoryAttachmentStore::new()),
        };
        let session_id = Uuid::new_v4();
        let handle = SessionActor::spawn(session_id, stores, SessionSettings::default());

        let (observer, mut obs_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle
            .observer_connect(observer, EventFilter::session(session_id))
            .await
            .unwrap();

        let frames = texts(&drain(&mut obs_rx));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["code"], "WS_INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_binary_frame_rejected() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let execution = pending_execution(&stores, session_id).await;
        let handle = SessionActor::spawn(session_id, stores.clone(), SessionSettings::default());

        let (worker, mut worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle.ingest_connect(worker.clone(), execution.id).await.unwrap();
        handle
            .ingest_message(&worker, IngestPayload::Binary)
            .await
            .unwrap();
        fence(&handle).await;

        let frames = texts(&drain(&mut worker_rx));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["code"], "WS_PROTOCOL_ERROR");

        // The connection is still usable afterwards.
        handle
            .ingest_message(&worker, text_frame("log", serde_json::json!({})))
            .await
            .unwrap();
        fence(&handle).await;
        let stored = stores
            .events
            .fetch(&EventFilter::session(session_id), 10)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_messages_are_protocol_errors() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let execution = pending_execution(&stores, session_id).await;
        let handle = SessionActor::spawn(session_id, stores.clone(), SessionSettings::default());

        let (worker, mut worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle.ingest_connect(worker.clone(), execution.id).await.unwrap();

        handle
            .ingest_message(&worker, IngestPayload::Text("not json".to_string()))
            .await
            .unwrap();
        handle
            .ingest_message(
                &worker,
                IngestPayload::Text(r#"{"streamEventType": ""}"#.to_string()),
            )
            .await
            .unwrap();
        fence(&handle).await;

        let frames = texts(&drain(&mut worker_rx));
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f["code"] == "WS_PROTOCOL_ERROR"));

        // Dropped messages are not persisted.
        let stored = stores
            .events
            .fetch(&EventFilter::session(session_id), 10)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_message_without_accept_is_internal_error() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let handle = SessionActor::spawn(session_id, stores, SessionSettings::default());

        let (worker, mut worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle
            .ingest_message(&worker, text_frame("log", serde_json::json!({})))
            .await
            .unwrap();
        fence(&handle).await;

        let frames = texts(&drain(&mut worker_rx));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["code"], "WS_INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_heartbeat_is_debounced() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let execution = pending_execution(&stores, session_id).await;
        let handle = SessionActor::spawn(session_id, stores.clone(), SessionSettings::default());

        let (worker, _worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle.ingest_connect(worker.clone(), execution.id).await.unwrap();
        let initial = stores
            .attachments
            .ingest(worker.id())
            .await
            .unwrap()
            .unwrap()
            .last_heartbeat_update;

        // Messages inside the debounce window leave the clock untouched.
        for _ in 0..3 {
            handle
                .ingest_message(&worker, text_frame("log", serde_json::json!({})))
                .await
                .unwrap();
        }
        fence(&handle).await;
        let attachment = stores.attachments.ingest(worker.id()).await.unwrap().unwrap();
        assert_eq!(attachment.last_heartbeat_update, initial);

        // Age the persisted clock past the interval; the next message
        // refreshes it.
        let mut aged = attachment.clone();
        aged.last_heartbeat_update = initial - chrono::Duration::seconds(60);
        stores.attachments.put_ingest(worker.id(), &aged).await.unwrap();

        handle
            .ingest_message(&worker, text_frame("log", serde_json::json!({})))
            .await
            .unwrap();
        fence(&handle).await;
        let refreshed = stores.attachments.ingest(worker.id()).await.unwrap().unwrap();
        assert!(refreshed.last_heartbeat_update > aged.last_heartbeat_update);
    }

    #[tokio::test]
    async fn test_events_survive_actor_reconstruction() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let execution = pending_execution(&stores, session_id).await;

        let first = SessionActor::spawn(session_id, stores.clone(), SessionSettings::default());
        let (worker, _worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
        first.ingest_connect(worker.clone(), execution.id).await.unwrap();
        for i in 0..3 {
            first
                .ingest_message(&worker, text_frame("log", serde_json::json!({"n": i})))
                .await
                .unwrap();
        }
        fence(&first).await;

        // A fresh actor over the same stores serves the full history.
        let second = SessionActor::spawn(session_id, stores, SessionSettings::default());
        let (observer, mut obs_rx) = ConnectionHandle::channel(Uuid::new_v4());
        second
            .observer_connect(observer, EventFilter::session(session_id))
            .await
            .unwrap();

        assert_eq!(texts(&drain(&mut obs_rx)).len(), 3);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let stores = memory_stores();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        let execution = pending_execution(&stores, session_a).await;
        let registry = SessionRegistry::new(stores, SessionSettings::default());

        let handle_b = registry.handle(session_b);
        let (observer, mut obs_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle_b
            .observer_connect(observer, EventFilter::session(session_b))
            .await
            .unwrap();

        let handle_a = registry.handle(session_a);
        let (worker, _worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
        handle_a.ingest_connect(worker.clone(), execution.id).await.unwrap();
        handle_a
            .ingest_message(&worker, text_frame("log", serde_json::json!({})))
            .await
            .unwrap();
        fence(&handle_a).await;
        fence(&handle_b).await;

        assert!(texts(&drain(&mut obs_rx)).is_empty());
    }

    #[tokio::test]
    async fn test_observer_count_tracks_attach_and_detach() {
        let stores = memory_stores();
        let session_id = Uuid::new_v4();
        let handle = SessionActor::spawn(session_id, stores, SessionSettings::default());

        assert_eq!(handle.observer_count().await.unwrap(), 0);
        let (observer, _obs_rx) = ConnectionHandle::channel(Uuid::new_v4());
        let conn_id = observer.id();
        handle
            .observer_connect(observer, EventFilter::session(session_id))
            .await
            .unwrap();
        assert_eq!(handle.observer_count().await.unwrap(), 1);

        handle.observer_close(conn_id).await.unwrap();
        assert_eq!(handle.observer_count().await.unwrap(), 0);
    }

    #[test]
    fn test_authorize_ingest() {
        let mut execution = Execution::new(Uuid::new_v4(), "secret");
        assert_eq!(
            authorize_ingest(None, "secret"),
            Err(IngestRejection::UnknownExecution)
        );
        assert_eq!(
            authorize_ingest(Some(&execution), "wrong"),
            Err(IngestRejection::InvalidToken)
        );
        assert_eq!(authorize_ingest(Some(&execution), "secret"), Ok(()));

        execution.status = ExecutionStatus::Running;
        assert_eq!(authorize_ingest(Some(&execution), "secret"), Ok(()));

        execution.status = ExecutionStatus::Completed;
        assert_eq!(
            authorize_ingest(Some(&execution), "secret"),
            Err(IngestRejection::NotAcceptingEvents)
        );
    }

    #[tokio::test]
    async fn test_error_code_shape_on_wire() {
        // Guard the wire contract of the error envelope end to end.
        let envelope = ErrorEnvelope::new(ErrorCode::WsProtocolError, "x");
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "WS_PROTOCOL_ERROR");
        assert_eq!(value["message"], "x");
    }
}
