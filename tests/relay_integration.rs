//! Integration tests for Beacon
//!
//! These tests drive the relay end to end over the SQLite-backed stores:
//! - beacon-store: event log, execution registry, attachments
//! - beacon-relay: session actor, replay, broadcast, lifecycle

use std::sync::Arc;

use beacon_relay::{
    ConnectionHandle, IngestPayload, OutboundFrame, SessionRegistry, SessionSettings,
    SessionStores,
};
use beacon_store::{
    EventFilter, Execution, ExecutionRegistry, ExecutionStatus, SqliteAttachmentStore,
    SqliteEventStore, SqliteExecutionRegistry,
};
use uuid::Uuid;

async fn sqlite_stores() -> SessionStores {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    beacon_store::init_schema(&pool).await.unwrap();

    SessionStores {
        events: Arc::new(SqliteEventStore::new(pool.clone())),
        executions: Arc::new(SqliteExecutionRegistry::new(pool.clone())),
        attachments: Arc::new(SqliteAttachmentStore::new(pool)),
    }
}

fn frame(event_type: &str, data: serde_json::Value) -> IngestPayload {
    IngestPayload::Text(
        serde_json::json!({"streamEventType": event_type, "data": data}).to_string(),
    )
}

fn received(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>,
) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Text(json) = frame {
            out.push(serde_json::from_str(&json).unwrap());
        }
    }
    out
}

#[tokio::test]
async fn test_full_relay_flow() {
    let stores = sqlite_stores().await;
    let session_id = Uuid::new_v4();
    let execution = Execution::new(session_id, "tok");
    stores.executions.create(&execution).await.unwrap();

    let registry = SessionRegistry::new(stores.clone(), SessionSettings::default());
    let handle = registry.handle(session_id);

    // Worker connects: pending -> running, heartbeat recorded.
    let (worker, _worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
    handle.ingest_connect(worker.clone(), execution.id).await.unwrap();
    let running = stores.executions.get(execution.id).await.unwrap().unwrap();
    assert_eq!(running.status, ExecutionStatus::Running);
    assert!(running.last_heartbeat_at.is_some());

    // Some output before any observer is attached.
    handle
        .ingest_message(&worker, frame("log", serde_json::json!({"line": "building"})))
        .await
        .unwrap();
    handle
        .ingest_message(
            &worker,
            frame("kilocode", serde_json::json!({"sessionId": "agent-9"})),
        )
        .await
        .unwrap();

    // Observer attaches mid-run: history first, then live events.
    let (observer, mut obs_rx) = ConnectionHandle::channel(Uuid::new_v4());
    handle
        .observer_connect(observer, EventFilter::session(session_id))
        .await
        .unwrap();

    handle
        .ingest_message(
            &worker,
            frame(
                "complete",
                serde_json::json!({"exitCode": 0, "currentBranch": "agent/change-1"}),
            ),
        )
        .await
        .unwrap();
    handle.observer_count().await.unwrap();

    let events = received(&mut obs_rx);
    assert_eq!(events.len(), 3);
    let types: Vec<&str> = events
        .iter()
        .map(|e| e["streamEventType"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["log", "kilocode", "complete"]);
    let ids: Vec<i64> = events.iter().map(|e| e["eventId"].as_i64().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    // Lifecycle side effects all landed.
    let done = stores.executions.get(execution.id).await.unwrap().unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.branch.as_deref(), Some("agent/change-1"));
    assert_eq!(done.agent_session_id.as_deref(), Some("agent-9"));
    assert_eq!(done.exit_code, Some(0));
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn test_observer_cursor_and_filters_over_sqlite() {
    let stores = sqlite_stores().await;
    let session_id = Uuid::new_v4();
    let execution = Execution::new(session_id, "tok");
    stores.executions.create(&execution).await.unwrap();

    let registry = SessionRegistry::new(stores.clone(), SessionSettings::default());
    let handle = registry.handle(session_id);

    let (worker, _worker_rx) = ConnectionHandle::channel(Uuid::new_v4());
    handle.ingest_connect(worker.clone(), execution.id).await.unwrap();
    for i in 0..10 {
        let event_type = if i % 2 == 0 { "log" } else { "metric" };
        handle
            .ingest_message(&worker, frame(event_type, serde_json::json!({"n": i})))
            .await
            .unwrap();
    }
    handle.observer_count().await.unwrap();

    // Cursor: only events after id 5.
    let (late, mut late_rx) = ConnectionHandle::channel(Uuid::new_v4());
    handle
        .observer_connect(late, EventFilter::session(session_id).with_from_id(5))
        .await
        .unwrap();
    let ids: Vec<i64> = received(&mut late_rx)
        .iter()
        .map(|e| e["eventId"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![6, 7, 8, 9, 10]);

    // Type filter applies to both replay and live delivery.
    let (logs_only, mut logs_rx) = ConnectionHandle::channel(Uuid::new_v4());
    handle
        .observer_connect(
            logs_only,
            EventFilter::session(session_id).with_event_types(vec!["log".to_string()]),
        )
        .await
        .unwrap();
    assert_eq!(received(&mut logs_rx).len(), 5);

    handle
        .ingest_message(&worker, frame("metric", serde_json::json!({"n": 10})))
        .await
        .unwrap();
    handle
        .ingest_message(&worker, frame("log", serde_json::json!({"n": 11})))
        .await
        .unwrap();
    handle.observer_count().await.unwrap();

    let live = received(&mut logs_rx);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0]["streamEventType"], "log");
}

#[tokio::test]
async fn test_ingest_replacement_over_sqlite() {
    let stores = sqlite_stores().await;
    let session_id = Uuid::new_v4();
    let execution = Execution::new(session_id, "tok");
    stores.executions.create(&execution).await.unwrap();

    let registry = SessionRegistry::new(stores.clone(), SessionSettings::default());
    let handle = registry.handle(session_id);

    let (first, mut first_rx) = ConnectionHandle::channel(Uuid::new_v4());
    handle.ingest_connect(first.clone(), execution.id).await.unwrap();
    let (second, _second_rx) = ConnectionHandle::channel(Uuid::new_v4());
    handle.ingest_connect(second.clone(), execution.id).await.unwrap();

    let mut closes = Vec::new();
    while let Ok(frame) = first_rx.try_recv() {
        if let OutboundFrame::Close { code, reason } = frame {
            closes.push((code, reason));
        }
    }
    assert_eq!(
        closes,
        vec![(1000, "replaced by new connection".to_string())]
    );

    // The replacement is the live connection; its events drive lifecycle.
    handle
        .ingest_message(&second, frame("complete", serde_json::json!({"exitCode": 7})))
        .await
        .unwrap();
    handle.observer_count().await.unwrap();

    let done = stores.executions.get(execution.id).await.unwrap().unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.exit_code, Some(7));
}
