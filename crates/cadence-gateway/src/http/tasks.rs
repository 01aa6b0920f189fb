//! Job control endpoints under `/api/tasks`.
//!
//! Thin adapters over [`SchedulerCenter`]: decode the request, call the
//! center, map [`SchedulerError`] kinds onto HTTP statuses. Errors are
//! returned as `{"code": ..., "message": ...}`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use cadence_core::types::JobId;
use cadence_scheduler::{
    error::ValidationError, ExecutionLogEntry, JobDefinition, JobQuery, JobView, LogQuery,
    Outcome, Page, Pagination, SchedulerCenter, SchedulerError, TriggerState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Create/edit payload. `id` is ignored on create and required on edit.
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<JobId>,
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub repeat_count: Option<i32>,
    pub handler_assembly: String,
    pub handler_class: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub pause_after_failure: bool,
    #[serde(default)]
    pub run_params: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub alert_email: Option<String>,
}

impl JobRequest {
    fn into_definition(self, id: JobId) -> JobDefinition {
        let mut def = JobDefinition::new(
            self.name,
            self.group,
            self.handler_assembly,
            self.handler_class,
        );
        def.id = id;
        def.cron_expression = self.cron_expression;
        def.interval_seconds = self.interval_seconds;
        def.repeat_count = self.repeat_count;
        def.start_time = self.start_time;
        def.end_time = self.end_time;
        def.is_enabled = self.is_enabled;
        def.pause_after_failure = self.pause_after_failure;
        def.run_params = self.run_params;
        def.description = self.description;
        def.principal = self.principal;
        def.alert_email = self.alert_email;
        def
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<JobId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: usize,
}

/// Live state after a lifecycle command.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: JobId,
    pub status: TriggerState,
}

#[derive(Debug, Deserialize)]
pub struct JobListParams {
    pub name: Option<String>,
    pub group: Option<String>,
    pub enabled: Option<bool>,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LogListParams {
    pub outcome: Option<Outcome>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

fn pagination(page: Option<u32>, size: Option<u32>) -> Pagination {
    let default = Pagination::default();
    Pagination::new(page.unwrap_or(default.page), size.unwrap_or(default.size))
}

/// POST /api/tasks/create
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JobRequest>,
) -> ApiResult<JobDefinition> {
    let def = req.into_definition(JobId::new());
    state.center.create_job(def).await.map(Json).map_err(api_error)
}

/// PUT /api/tasks/edit
pub async fn edit(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<JobRequest>,
) -> ApiResult<JobDefinition> {
    let id = req
        .id
        .take()
        .ok_or_else(|| api_error(ValidationError::MissingField("id").into()))?;
    let def = req.into_definition(id);
    state.center.update_job(def).await.map(Json).map_err(api_error)
}

/// DELETE /api/tasks/delete
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<DeleteResponse> {
    let deleted = state.center.delete_jobs(&req.ids).await.map_err(api_error)?;
    Ok(Json(DeleteResponse { deleted }))
}

/// GET /api/tasks/query?name=&group=&enabled=&page=&size=
pub async fn query(
    State(state): State<Arc<AppState>>,
    Query(params): Query<JobListParams>,
) -> ApiResult<Page<JobView>> {
    let criteria = JobQuery {
        name: params.name,
        group: params.group,
        enabled: params.enabled,
    };
    state
        .center
        .list_jobs(&criteria, &pagination(params.page, params.size))
        .map(Json)
        .map_err(api_error)
}

/// GET /api/tasks/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<JobView> {
    state.center.get_job(&JobId::from(id)).map(Json).map_err(api_error)
}

/// PUT /api/tasks/execute/{id}
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusResponse> {
    let id = JobId::from(id);
    state.center.execute(&id).await.map_err(api_error)?;
    Ok(status_of(&state.center, id))
}

/// PUT /api/tasks/pause/{id}
pub async fn pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusResponse> {
    let id = JobId::from(id);
    state.center.pause_job(&id).await.map_err(api_error)?;
    Ok(status_of(&state.center, id))
}

/// PUT /api/tasks/resume/{id}
pub async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusResponse> {
    let id = JobId::from(id);
    state.center.resume_job(&id).await.map_err(api_error)?;
    Ok(status_of(&state.center, id))
}

/// GET /api/tasks/logs/query/{id}?outcome=&started_after=&started_before=&page=&size=
pub async fn query_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LogListParams>,
) -> ApiResult<Page<ExecutionLogEntry>> {
    let criteria = LogQuery {
        job_id: Some(JobId::from(id)),
        outcome: params.outcome,
        started_after: params.started_after,
        started_before: params.started_before,
    };
    state
        .center
        .query_logs(&criteria, &pagination(params.page, params.size))
        .map(Json)
        .map_err(api_error)
}

fn status_of(center: &SchedulerCenter, id: JobId) -> Json<StatusResponse> {
    let status = center.status(&id);
    Json(StatusResponse { id, status })
}

fn status_for(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
        SchedulerError::JobNotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::DuplicateJob { .. }
        | SchedulerError::AlreadyArmed { .. }
        | SchedulerError::AlreadyRunning { .. }
        | SchedulerError::WrongState { .. }
        | SchedulerError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        SchedulerError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::HandlerNotFound { .. }
        | SchedulerError::Timeout { .. }
        | SchedulerError::HandlerFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: SchedulerError) -> (StatusCode, Json<ApiError>) {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(code = err.code(), "task request failed: {err}");
    }
    (
        status,
        Json(ApiError {
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    )
}
