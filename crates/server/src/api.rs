//! HTTP API for scheduled tasks, profiles and records.
//!
//! Every call goes through the identity's session actor, so it is ordered
//! with that identity's frames and alarm sweeps.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::db::StoreError;
use crate::profile::{Goals, Profile};
use crate::scheduler::{ScheduledTask, TaskError};
use crate::session_command::SessionCommand;
use crate::state::SessionRegistry;

const DEFAULT_RECORD_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),

    #[error("session actor for {0} is unavailable")]
    ActorUnavailable(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Task(TaskError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Task(TaskError::StateConflict { .. }) => StatusCode::CONFLICT,
            ApiError::Task(TaskError::UnknownTask(_) | TaskError::DueAtOutOfRange(_))
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(
                component = "api",
                event = "api.request_failed",
                error = %self,
                "API request failed"
            );
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub task_name: String,
    #[serde(default)]
    pub payload: Value,
    pub due_at: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    #[serde(default)]
    pub prefix: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub keys: Vec<String>,
}

pub fn routes() -> Router<Arc<SessionRegistry>> {
    Router::new()
        .route("/api/identities/{identity}/tasks", post(schedule_task))
        .route(
            "/api/identities/{identity}/tasks/{task_id}",
            get(task_status).delete(cancel_task),
        )
        .route(
            "/api/identities/{identity}/tasks/{task_id}/retry",
            post(retry_task),
        )
        .route("/api/identities/{identity}/profile", get(get_profile))
        .route("/api/identities/{identity}/goals", put(update_goals))
        .route("/api/identities/{identity}/records", get(list_records))
        .route(
            "/api/identities/{identity}/records/{key}",
            delete(delete_record),
        )
}

/// Ask the identity's actor and flatten "actor gone" into an error.
async fn ask<T, E>(
    state: &SessionRegistry,
    identity: &str,
    build: impl FnOnce(tokio::sync::oneshot::Sender<Result<T, E>>) -> SessionCommand,
) -> Result<T, ApiError>
where
    ApiError: From<E>,
{
    let actor = state.get_or_spawn(identity);
    match actor.request(build).await {
        Some(result) => result.map_err(ApiError::from),
        None => Err(ApiError::ActorUnavailable(identity.to_string())),
    }
}

async fn schedule_task(
    State(state): State<Arc<SessionRegistry>>,
    Path(identity): Path<String>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ScheduleResponse>), ApiError> {
    let Json(req) = body?;
    let task_id = ask(&state, &identity, |reply| SessionCommand::ScheduleTask {
        task_name: req.task_name,
        payload: req.payload,
        due_at: req.due_at,
        reply,
    })
    .await?;
    Ok((StatusCode::CREATED, Json(ScheduleResponse { task_id })))
}

async fn task_status(
    State(state): State<Arc<SessionRegistry>>,
    Path((identity, task_id)): Path<(String, String)>,
) -> Result<Json<ScheduledTask>, ApiError> {
    ask(&state, &identity, |reply| SessionCommand::TaskStatus { task_id, reply })
        .await
        .map(Json)
}

async fn cancel_task(
    State(state): State<Arc<SessionRegistry>>,
    Path((identity, task_id)): Path<(String, String)>,
) -> Result<Json<ScheduledTask>, ApiError> {
    ask(&state, &identity, |reply| SessionCommand::CancelTask { task_id, reply })
        .await
        .map(Json)
}

async fn retry_task(
    State(state): State<Arc<SessionRegistry>>,
    Path((identity, task_id)): Path<(String, String)>,
) -> Result<Json<ScheduledTask>, ApiError> {
    ask(&state, &identity, |reply| SessionCommand::RetryTask { task_id, reply })
        .await
        .map(Json)
}

async fn get_profile(
    State(state): State<Arc<SessionRegistry>>,
    Path(identity): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    ask(&state, &identity, |reply| SessionCommand::GetProfile { reply })
        .await
        .map(Json)
}

async fn update_goals(
    State(state): State<Arc<SessionRegistry>>,
    Path(identity): Path<String>,
    body: Result<Json<Goals>, JsonRejection>,
) -> Result<Json<Profile>, ApiError> {
    let Json(goals) = body?;
    ask(&state, &identity, |reply| SessionCommand::UpdateGoals { goals, reply })
        .await
        .map(Json)
}

async fn list_records(
    State(state): State<Arc<SessionRegistry>>,
    Path(identity): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_RECORD_LIMIT);
    let keys = ask(&state, &identity, |reply| SessionCommand::ListRecords {
        prefix: query.prefix,
        limit,
        reply,
    })
    .await?;
    Ok(Json(RecordsResponse { keys }))
}

async fn delete_record(
    State(state): State<Arc<SessionRegistry>>,
    Path((identity, key)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let removed = ask(&state, &identity, |reply| SessionCommand::DeleteRecord { key, reply }).await?;
    Ok(if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}
