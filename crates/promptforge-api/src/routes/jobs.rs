//! Job inspection and lifecycle endpoints.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use promptforge_core::repository::{JobUpdate, ListFilter, LogQuery};
use promptforge_core::{JobStatus, JobType};

use crate::error::{body_issue, ApiError, FieldIssue};
use crate::state::AppState;
use crate::views;

const STATUS_VALUES: &str = "pending, validating, running, success, failed, cancelled";
const JOB_TYPE_VALUES: &str = "run, grid_search";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(get_job).delete(delete_job))
        .route("/jobs/:job_id/summary", get(get_job_summary))
        .route("/jobs/:job_id/logs", get(get_job_logs))
        .route("/jobs/:job_id/payload", get(get_job_payload))
        .route("/jobs/:job_id/artifact", get(get_job_artifact))
        .route("/jobs/:job_id/grid-result", get(get_grid_result))
        .route("/jobs/:job_id/cancel", post(cancel_job))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    username: Option<String>,
    job_type: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// List jobs with filters and pagination. Filter typos are rejected with a
/// 422 rather than silently matching nothing.
async fn list_jobs(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params.map_err(|rejection| body_issue(rejection.body_text(), "invalid_query"))?;

    let mut issues: Vec<FieldIssue> = Vec::new();

    let status = match &params.status {
        Some(raw) => match JobStatus::from_str(raw) {
            Some(status) => Some(status),
            None => {
                issues.push(FieldIssue {
                    field: "status".to_string(),
                    message: format!("Invalid status '{raw}'. Expected one of: {STATUS_VALUES}."),
                    kind: "enum".to_string(),
                });
                None
            }
        },
        None => None,
    };

    let job_type = match &params.job_type {
        Some(raw) => match JobType::from_str(raw) {
            Some(job_type) => Some(job_type),
            None => {
                issues.push(FieldIssue {
                    field: "job_type".to_string(),
                    message: format!(
                        "Invalid job_type '{raw}'. Expected one of: {JOB_TYPE_VALUES}."
                    ),
                    kind: "enum".to_string(),
                });
                None
            }
        },
        None => None,
    };

    let limit = params.limit.unwrap_or(50);
    if !(1..=500).contains(&limit) {
        issues.push(FieldIssue {
            field: "limit".to_string(),
            message: "limit must be between 1 and 500.".to_string(),
            kind: "range".to_string(),
        });
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        issues.push(FieldIssue {
            field: "offset".to_string(),
            message: "offset must not be negative.".to_string(),
            kind: "range".to_string(),
        });
    }

    if !issues.is_empty() {
        return Err(ApiError::InvalidRequest(issues));
    }

    let filter = ListFilter {
        status,
        username: params.username.clone(),
        job_type,
        limit,
        offset,
    };
    let total = state.store.count_jobs(&filter).await?;
    let rows = state.store.list_jobs(&filter).await?;
    let items: Vec<Value> = rows.iter().map(views::summary_json).collect();

    Ok(Json(json!({
        "items": items,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// Full job detail: metadata, latest metrics, all progress events and logs,
/// and the result once available.
async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get_job(&job_id).await.map_err(job_lookup(&job_id))?;
    let events = state.store.get_progress_events(&job_id).await?;
    let logs = state.store.get_logs(&job_id, &LogQuery::default()).await?;
    Ok(Json(views::detail_json(&record, &events, &logs)))
}

async fn get_job_summary(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get_job(&job_id).await.map_err(job_lookup(&job_id))?;
    Ok(Json(views::summary_json(&record)))
}

#[derive(Debug, Deserialize)]
struct LogParams {
    limit: Option<i64>,
    offset: Option<i64>,
    level: Option<String>,
}

/// Paginated, level-filtered logs. The level match is case-insensitive; an
/// offset past the end returns an empty list.
async fn get_job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    params: Result<Query<LogParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params.map_err(|rejection| body_issue(rejection.body_text(), "invalid_query"))?;

    let mut issues: Vec<FieldIssue> = Vec::new();
    if let Some(limit) = params.limit {
        if limit < 1 {
            issues.push(FieldIssue {
                field: "limit".to_string(),
                message: "limit must be at least 1.".to_string(),
                kind: "range".to_string(),
            });
        }
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        issues.push(FieldIssue {
            field: "offset".to_string(),
            message: "offset must not be negative.".to_string(),
            kind: "range".to_string(),
        });
    }
    if !issues.is_empty() {
        return Err(ApiError::InvalidRequest(issues));
    }

    if !state.store.job_exists(&job_id).await? {
        warn!("Job logs requested for unknown job_id={job_id}");
        return Err(ApiError::NotFound(format!("Unknown job '{job_id}'.")));
    }

    let query = LogQuery {
        limit: params.limit,
        offset,
        level: params.level.clone(),
    };
    let logs = state.store.get_logs(&job_id, &query).await?;
    let total = state
        .store
        .get_log_count(&job_id, params.level.as_deref())
        .await?;

    Ok(Json(json!({
        "job_id": job_id,
        "items": logs.iter().map(views::log_json).collect::<Vec<_>>(),
        "total": total,
        "offset": offset,
        "limit": params.limit,
        "level": params.level,
    })))
}

/// The original submission payload, verbatim, plus the job type so the
/// client knows which endpoint accepts a resubmission.
async fn get_job_payload(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get_job(&job_id).await.map_err(job_lookup(&job_id))?;
    let payload = record.payload.ok_or_else(|| {
        ApiError::NotFound(format!("Job '{job_id}' has no stored payload."))
    })?;
    Ok(Json(json!({
        "job_id": job_id,
        "job_type": record.job_type,
        "payload": payload,
    })))
}

/// The optimized-program artifact of a successful run job.
async fn get_job_artifact(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get_job(&job_id).await.map_err(job_lookup(&job_id))?;

    if record.job_type == JobType::GridSearch {
        return Err(ApiError::NotFound(format!(
            "Grid-search jobs publish results at /jobs/{job_id}/grid-result."
        )));
    }

    match record.status {
        JobStatus::Success => {
            let artifact = record
                .result
                .as_ref()
                .and_then(|result| result.get("program_artifact"))
                .cloned();
            match artifact {
                Some(artifact) if !artifact.is_null() => Ok(Json(json!({
                    "job_id": job_id,
                    "program_artifact": artifact,
                }))),
                _ => Err(ApiError::NotFound(
                    "Job did not produce an artifact.".to_string(),
                )),
            }
        }
        JobStatus::Failed => {
            let message = record.message.unwrap_or_else(|| "unknown error".to_string());
            Err(ApiError::Conflict(format!("Job failed: {message}")))
        }
        JobStatus::Cancelled => Err(ApiError::Conflict("Job was cancelled.".to_string())),
        _ => Err(ApiError::Conflict("Job has not finished yet.".to_string())),
    }
}

/// The per-pair result table of a terminal grid-search job.
async fn get_grid_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get_job(&job_id).await.map_err(job_lookup(&job_id))?;

    if record.job_type == JobType::Run {
        return Err(ApiError::NotFound(format!(
            "Run jobs publish results at /jobs/{job_id}/artifact."
        )));
    }
    if !record.status.is_terminal() {
        return Err(ApiError::Conflict("Job has not finished yet.".to_string()));
    }
    match record.result {
        Some(result) => Ok(Json(json!({
            "job_id": job_id,
            "status": record.status,
            "grid_result": result,
        }))),
        None => Err(ApiError::Conflict(
            "Job did not produce a grid result.".to_string(),
        )),
    }
}

/// Signal cancellation. The store is updated synchronously; the worker
/// observes the flag on its next poll and tears the subprocess down.
async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get_job(&job_id).await.map_err(job_lookup(&job_id))?;

    if record.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Job is already in terminal state '{}'.",
            record.status
        )));
    }

    state.pool.cancel_job(&job_id);
    state
        .store
        .update_job(
            &job_id,
            JobUpdate::new()
                .status(JobStatus::Cancelled)
                .message("Cancelled by user")
                .completed_at(Utc::now()),
        )
        .await?;

    info!("Job {job_id} cancelled");
    Ok(Json(json!({"job_id": job_id, "status": "cancelled"})))
}

/// Delete a terminal job and everything attached to it.
async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get_job(&job_id).await.map_err(job_lookup(&job_id))?;

    if !record.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Cannot delete job in '{}' state. Cancel it first.",
            record.status
        )));
    }

    state.store.delete_job(&job_id).await?;
    info!("Job {job_id} deleted");
    Ok(Json(json!({"job_id": job_id, "deleted": true})))
}

/// Collapse store lookup failures into the endpoint's 404 wording.
fn job_lookup(job_id: &str) -> impl Fn(promptforge_core::Error) -> ApiError + '_ {
    move |err| match err {
        promptforge_core::Error::NotFound(_) => {
            warn!("Request for unknown job_id={job_id}");
            ApiError::NotFound(format!("Unknown job '{job_id}'."))
        }
        other => other.into(),
    }
}
