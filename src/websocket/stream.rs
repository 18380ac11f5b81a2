//! Stream endpoint: history replay plus live filtered events for observers.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use beacon_relay::{ConnectionHandle, SessionHandle, SessionRegistry};
use beacon_store::EventFilter;

use super::forward_frame;

/// Raw query parameters accepted by the stream endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    /// Replay cursor: only events with id strictly greater than this
    pub from_id: Option<i64>,
    /// Comma-separated execution ids
    pub execution_ids: Option<String>,
    /// Comma-separated event types
    pub event_types: Option<String>,
    /// Window start, ms-since-epoch or RFC 3339
    pub start_time: Option<String>,
    /// Window end, ms-since-epoch or RFC 3339
    pub end_time: Option<String>,
}

/// Build the connection's filters from query parameters. The session id
/// comes from the route, never from the client's query string.
pub fn parse_filters(session_id: Uuid, params: &StreamParams) -> Result<EventFilter, String> {
    let mut filter = EventFilter::session(session_id);
    filter.from_id = params.from_id;

    if let Some(raw) = &params.execution_ids {
        let ids = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Uuid::parse_str(s).map_err(|_| format!("invalid execution id: {s}")))
            .collect::<Result<Vec<_>, _>>()?;
        if !ids.is_empty() {
            filter.execution_ids = Some(ids);
        }
    }
    if let Some(raw) = &params.event_types {
        let types: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if !types.is_empty() {
            filter.event_types = Some(types);
        }
    }
    filter.start_time = parse_instant(params.start_time.as_deref(), "startTime")?;
    filter.end_time = parse_instant(params.end_time.as_deref(), "endTime")?;
    Ok(filter)
}

fn parse_instant(raw: Option<&str>, name: &str) -> Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(Some)
            .ok_or_else(|| format!("{name} out of range: {raw}"));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|_| format!("invalid {name}: {raw}"))
}

/// WebSocket upgrade handler for the stream endpoint.
pub async fn stream_handler(
    ws: Option<WebSocketUpgrade>,
    Path(session_id): Path<Uuid>,
    Query(params): Query<StreamParams>,
    Extension(sessions): Extension<SessionRegistry>,
) -> Response {
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    };
    let filters = match parse_filters(session_id, &params) {
        Ok(filters) => filters,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    let handle = sessions.handle(session_id);
    ws.on_upgrade(move |socket| handle_socket(socket, handle, filters))
}

/// Observer socket task: attaches to the session actor, pumps replayed and
/// live frames out, and answers pings. Observers are send-only; inbound
/// text is ignored.
async fn handle_socket(socket: WebSocket, handle: SessionHandle, filters: EventFilter) {
    let conn_id = Uuid::new_v4();
    let session_id = handle.session_id();
    info!(conn_id = %conn_id, session_id = %session_id, "Stream connection established");

    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = ConnectionHandle::channel(conn_id);

    // Replay may span many rounds; pump frames while it runs instead of
    // buffering the whole history behind the attach ack.
    let attach_handle = handle.clone();
    let attach = tokio::spawn(async move {
        if let Err(e) = attach_handle.observer_connect(conn, filters).await {
            warn!(conn_id = %conn_id, error = %e, "Observer attach failed");
        }
    });

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if !forward_frame(&mut sender, frame).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "Stream socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    attach.abort();
    let _ = handle.observer_close(conn_id).await;
    info!(conn_id = %conn_id, session_id = %session_id, "Stream connection ended");
}
