//! Execution management endpoints.
//!
//! Minimal bootstrap surface: create an execution (which mints its ingest
//! token), read back its lifecycle state, and count live observers on a
//! session. Authentication of these endpoints is a deployment concern and
//! lives in front of the relay.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use beacon_relay::SessionRegistry;
use beacon_store::Execution;

use super::ApiResponse;

/// Execution state as reported to callers
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub execution_id: Uuid,
    pub session_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl From<Execution> for ExecutionResponse {
    fn from(execution: Execution) -> Self {
        Self {
            execution_id: execution.id,
            session_id: execution.session_id,
            status: execution.status.to_string(),
            branch: execution.branch,
            agent_session_id: execution.agent_session_id,
            error: execution.error,
            exit_code: execution.exit_code,
            created_at: execution.created_at,
            completed_at: execution.completed_at,
            last_heartbeat_at: execution.last_heartbeat_at,
        }
    }
}

/// Response for a newly created execution; the ingest token is returned
/// exactly once, here.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExecutionResponse {
    pub execution_id: Uuid,
    pub session_id: Uuid,
    pub status: String,
    pub ingest_token: String,
}

/// Observer count for a session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverCountResponse {
    pub session_id: Uuid,
    pub observers: usize,
}

/// POST `/v1/sessions/{session_id}/executions`
pub async fn create_execution(
    Extension(sessions): Extension<SessionRegistry>,
    Path(session_id): Path<Uuid>,
) -> impl IntoResponse {
    let execution = Execution::new(session_id, Uuid::new_v4().simple().to_string());

    match sessions.stores().executions.create(&execution).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(CreateExecutionResponse {
                execution_id: execution.id,
                session_id,
                status: execution.status.to_string(),
                ingest_token: execution.ingest_token,
            })),
        )
            .into_response(),
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Failed to create execution");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<CreateExecutionResponse>::error(
                    "failed to create execution",
                )),
            )
                .into_response()
        }
    }
}

/// GET `/v1/executions/{execution_id}`
pub async fn get_execution(
    Extension(sessions): Extension<SessionRegistry>,
    Path(execution_id): Path<Uuid>,
) -> impl IntoResponse {
    match sessions.stores().executions.get(execution_id).await {
        Ok(Some(execution)) => (
            StatusCode::OK,
            Json(ApiResponse::success(ExecutionResponse::from(execution))),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<ExecutionResponse>::error("execution not found")),
        )
            .into_response(),
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "Failed to load execution");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<ExecutionResponse>::error(
                    "failed to load execution",
                )),
            )
                .into_response()
        }
    }
}

/// GET `/v1/sessions/{session_id}/observers`
pub async fn observer_count(
    Extension(sessions): Extension<SessionRegistry>,
    Path(session_id): Path<Uuid>,
) -> impl IntoResponse {
    match sessions.handle(session_id).observer_count().await {
        Ok(observers) => (
            StatusCode::OK,
            Json(ApiResponse::success(ObserverCountResponse {
                session_id,
                observers,
            })),
        )
            .into_response(),
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Failed to count observers");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<ObserverCountResponse>::error(
                    "failed to count observers",
                )),
            )
                .into_response()
        }
    }
}
