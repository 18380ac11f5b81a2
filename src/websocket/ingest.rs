//! Ingest endpoint: the single worker connection per execution.
//!
//! Establishment errors are HTTP statuses; once upgraded, everything is
//! wire envelopes and the socket stays open through bad messages.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use beacon_relay::{
    authorize_ingest, ConnectionHandle, IngestPayload, IngestRejection, SessionHandle,
    SessionRegistry,
};

use super::forward_frame;

/// Query parameters accepted by the ingest endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestParams {
    /// Execution this worker streams for
    pub execution_id: Option<Uuid>,
    /// One-time ingest token minted at execution creation
    pub token: Option<String>,
}

/// WebSocket upgrade handler for the ingest endpoint.
pub async fn ingest_handler(
    ws: Option<WebSocketUpgrade>,
    Path(session_id): Path<Uuid>,
    Query(params): Query<IngestParams>,
    Extension(sessions): Extension<SessionRegistry>,
) -> Response {
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    };
    let Some(execution_id) = params.execution_id else {
        return (StatusCode::BAD_REQUEST, "executionId is required").into_response();
    };

    let execution = match sessions.stores().executions.get(execution_id).await {
        Ok(execution) => execution.filter(|e| e.session_id == session_id),
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "Failed to load execution");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to load execution")
                .into_response();
        }
    };

    match authorize_ingest(execution.as_ref(), params.token.as_deref().unwrap_or_default()) {
        Ok(()) => {}
        Err(IngestRejection::UnknownExecution) => {
            return (StatusCode::NOT_FOUND, "unknown execution").into_response();
        }
        Err(IngestRejection::InvalidToken) => {
            return (StatusCode::UNAUTHORIZED, "invalid ingest token").into_response();
        }
        Err(IngestRejection::NotAcceptingEvents) => {
            return (StatusCode::CONFLICT, "execution is not accepting events").into_response();
        }
    }

    let handle = sessions.handle(session_id);
    ws.on_upgrade(move |socket| handle_socket(socket, handle, execution_id))
}

/// Worker socket task: attaches as the execution's single ingest
/// connection and feeds every inbound frame to the session actor.
async fn handle_socket(socket: WebSocket, handle: SessionHandle, execution_id: Uuid) {
    let conn_id = Uuid::new_v4();
    let session_id = handle.session_id();
    info!(conn_id = %conn_id, session_id = %session_id, execution_id = %execution_id, "Ingest connection established");

    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = ConnectionHandle::channel(conn_id);

    if handle.ingest_connect(conn.clone(), execution_id).await.is_err() {
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

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
                    Some(Ok(Message::Text(text))) => {
                        if handle.ingest_message(&conn, IngestPayload::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        if handle.ingest_message(&conn, IngestPayload::Binary).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "Ingest socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = handle.ingest_close(conn_id).await;
    info!(conn_id = %conn_id, session_id = %session_id, "Ingest connection ended");
}
