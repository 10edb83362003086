use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use super::AppState;
use super::errors::ApiError;
use crate::queue::{Job, JobFilter, JobStatus, MAX_LIST_LIMIT};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const API_VERSION: &str = "1.0";

/// More jobs than this in `processing` means the worker is likely stuck.
pub const STUCK_JOB_THRESHOLD: u64 = 5;

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn worker_json(state: &AppState) -> Value {
    json!({
        "status": if state.worker.is_running() { "running" } else { "stopped" },
        "last_job_completed": state.worker.last_job_completed(),
    })
}

#[derive(serde::Deserialize)]
pub struct ExecuteParams {
    pub context: Option<String>,
    pub hash: Option<String>,
}

pub async fn execute(
    State(state): State<AppState>,
    Query(params): Query<ExecuteParams>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let context = non_empty(params.context);
    let hash = non_empty(params.hash);

    let id = state.queue.enqueue(context.as_deref(), hash.as_deref())?;
    let job = state.queue.get_job(&id)?.ok_or_else(|| {
        tracing::error!(job_id = %id, "enqueued job is not readable");
        ApiError::internal()
    })?;

    tracing::info!(job_id = %id, ?context, ?hash, "job queued");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(serde::Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub context: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let status = non_empty(params.status)
        .map(|status| status.parse::<JobStatus>())
        .transpose()?;
    let limit = match non_empty(params.limit) {
        Some(limit) => Some(
            limit
                .parse::<u32>()
                .map_err(|_| ApiError::bad_request(format!("Invalid limit: {limit}")))?,
        ),
        None => None,
    };
    let offset = match non_empty(params.offset) {
        Some(offset) => offset
            .parse::<u32>()
            .map_err(|_| ApiError::bad_request(format!("Invalid offset: {offset}")))?,
        None => 0,
    };

    let filter = JobFilter {
        status,
        context: non_empty(params.context),
        limit: limit.map(|limit| limit.min(MAX_LIST_LIMIT)),
        offset,
    };
    let jobs = state.queue.list_jobs(&filter)?;
    let total = state.queue.count_jobs(status)?;

    Ok(Json(json!({
        "total": total,
        "limit": filter.effective_limit(),
        "offset": filter.offset,
        "jobs": jobs,
    })))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .queue
        .get_job(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job not found: {id}")))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .queue
        .get_job(&id)?
        .ok_or_else(|| ApiError::not_found(format!("Job not found: {id}")))?;
    if job.status != JobStatus::Pending {
        return Err(ApiError::bad_request(format!(
            "Cannot cancel job in status: {}",
            job.status
        )));
    }

    if !state.queue.cancel_job(&id)? {
        // The worker claimed it between the read and the cancel.
        let status = state
            .queue
            .get_job(&id)?
            .map_or_else(|| "deleted".to_string(), |job| job.status.to_string());
        return Err(ApiError::bad_request(format!(
            "Cannot cancel job in status: {status}"
        )));
    }

    tracing::info!(job_id = %id, "job cancelled");
    Ok(Json(json!({
        "job_id": id,
        "status": JobStatus::Cancelled,
        "message": "Job cancelled successfully",
    })))
}

pub async fn health(State(state): State<AppState>) -> Response {
    let mut errors = Vec::new();

    let backend_ok = state.queue.health_check();
    if !backend_ok {
        errors.push("Queue backend not accessible".to_string());
    }
    if !state.worker.is_alive() {
        errors.push("Worker thread not running".to_string());
    }

    let mut processing = None;
    if backend_ok {
        match state.queue.count_jobs(Some(JobStatus::Processing)) {
            Ok(count) if count > STUCK_JOB_THRESHOLD => {
                errors.push(format!("Too many processing jobs: {count}"));
            }
            Ok(count) => processing = Some(count),
            Err(e) => errors.push(format!("Failed to count processing jobs: {e}")),
        }
    }

    if !errors.is_empty() {
        tracing::warn!(?errors, "health check failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "errors": errors,
                "timestamp": timestamp(),
            })),
        )
            .into_response();
    }

    Json(json!({
        "status": "healthy",
        "version": VERSION,
        "queue": {
            "backend": state.queue.backend_name(),
            "pending_jobs": state.queue.get_queue_depth().ok(),
            "processing_jobs": processing,
        },
        "worker": worker_json(&state),
        "timestamp": timestamp(),
    }))
    .into_response()
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state.queue.get_stats()?;
    let depth = state.queue.get_queue_depth()?;

    Ok(Json(json!({
        "jobs": {
            "total": stats.total_jobs,
            "pending": stats.pending,
            "processing": stats.processing,
            "completed": stats.completed,
            "failed": stats.failed,
            "cancelled": stats.cancelled,
        },
        "performance": {
            "average_execution_time": stats
                .average_execution_time
                .map(|secs| format!("{secs:.2}s")),
        },
        "queue": {
            "backend": state.queue.backend_name(),
            "depth": depth,
        },
        "worker": worker_json(&state),
        "timestamp": timestamp(),
    })))
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "version": VERSION,
        "api_version": API_VERSION,
    }))
}
