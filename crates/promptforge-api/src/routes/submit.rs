//! Job intake: `POST /run` and `POST /grid-search`.
//!
//! Intake stores the payload verbatim alongside a derived overview, so
//! `/jobs/{id}/payload` can hand back exactly what the client sent.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use promptforge_core::models::{GridSearchRequest, ModelSettings, RunRequest};
use promptforge_core::JobType;

use crate::error::{body_issue, issues_from_validation, ApiError};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/run", post(submit_run))
        .route("/grid-search", post(submit_grid))
}

/// Structural parse + constraint validation, both reported as 422.
fn parse_payload<T: DeserializeOwned + Validate>(raw: &Value) -> Result<T, ApiError> {
    let parsed: T = serde_json::from_value(raw.clone())
        .map_err(|err| body_issue(err.to_string(), "invalid_type"))?;
    parsed
        .validate()
        .map_err(|errors| ApiError::InvalidRequest(issues_from_validation(&errors)))?;
    Ok(parsed)
}

fn raw_body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, ApiError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(body_issue(rejection.body_text(), "invalid_json")),
    }
}

fn model_names(models: &[ModelSettings]) -> Vec<String> {
    models
        .iter()
        .map(ModelSettings::normalized_identifier)
        .collect()
}

fn run_overview(request: &RunRequest) -> Map<String, Value> {
    let mut overview = Map::new();
    overview.insert("username".to_string(), json!(request.username));
    overview.insert("module_name".to_string(), json!(request.module_name));
    overview.insert("module_kwargs".to_string(), json!(request.module_kwargs));
    overview.insert("optimizer_name".to_string(), json!(request.optimizer_name));
    overview.insert(
        "optimizer_kwargs".to_string(),
        json!(request.optimizer_kwargs),
    );
    overview.insert("compile_kwargs".to_string(), json!(request.compile_kwargs));
    overview.insert(
        "model_name".to_string(),
        json!(request.model_settings.normalized_identifier()),
    );
    overview.insert("model_settings".to_string(), json!(request.model_settings));
    overview.insert(
        "reflection_model_name".to_string(),
        json!(request
            .reflection_model_settings
            .as_ref()
            .map(ModelSettings::normalized_identifier)),
    );
    overview.insert(
        "prompt_model_name".to_string(),
        json!(request
            .prompt_model_settings
            .as_ref()
            .map(ModelSettings::normalized_identifier)),
    );
    overview.insert(
        "task_model_name".to_string(),
        json!(request
            .task_model_settings
            .as_ref()
            .map(ModelSettings::normalized_identifier)),
    );
    overview.insert("column_mapping".to_string(), json!(request.column_mapping));
    overview.insert("dataset_rows".to_string(), json!(request.dataset.len()));
    overview.insert(
        "split_fractions".to_string(),
        json!(request.split_fractions),
    );
    overview.insert("shuffle".to_string(), json!(request.shuffle));
    overview.insert("seed".to_string(), json!(request.seed));
    overview
}

fn grid_overview(request: &GridSearchRequest) -> Map<String, Value> {
    let mut overview = Map::new();
    overview.insert("username".to_string(), json!(request.username));
    overview.insert("module_name".to_string(), json!(request.module_name));
    overview.insert("module_kwargs".to_string(), json!(request.module_kwargs));
    overview.insert("optimizer_name".to_string(), json!(request.optimizer_name));
    overview.insert(
        "optimizer_kwargs".to_string(),
        json!(request.optimizer_kwargs),
    );
    overview.insert("compile_kwargs".to_string(), json!(request.compile_kwargs));
    overview.insert("column_mapping".to_string(), json!(request.column_mapping));
    overview.insert("dataset_rows".to_string(), json!(request.dataset.len()));
    overview.insert(
        "split_fractions".to_string(),
        json!(request.split_fractions),
    );
    overview.insert("shuffle".to_string(), json!(request.shuffle));
    overview.insert("seed".to_string(), json!(request.seed));
    overview.insert(
        "generation_models".to_string(),
        json!(model_names(&request.generation_models)),
    );
    overview.insert(
        "reflection_models".to_string(),
        json!(model_names(&request.reflection_models)),
    );
    overview.insert("total_pairs".to_string(), json!(request.total_pairs()));
    overview
}

async fn create_and_enqueue(
    state: &AppState,
    job_type: JobType,
    raw: Value,
    overview: Map<String, Value>,
) -> Result<String, ApiError> {
    let job_id = Uuid::new_v4().to_string();
    state.store.create_job(&job_id).await?;
    state.store.set_payload_overview(&job_id, &overview).await?;
    state.pool.submit_job(&job_id, job_type, raw).await?;
    Ok(job_id)
}

/// Validate and queue a single optimization run.
async fn submit_run(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let raw = raw_body(payload)?;
    let request: RunRequest = parse_payload(&raw)?;

    if let Err(err) = state.executor.validate(&request) {
        warn!("Payload validation failed: {err}");
        return Err(err.into());
    }

    let overview = run_overview(&request);
    let job_id = create_and_enqueue(&state, JobType::Run, raw, overview).await?;

    info!(
        "Enqueued job {job_id} for module={} optimizer={}",
        request.module_name, request.optimizer_name
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "job_id": job_id,
            "job_type": JobType::Run,
            "status": "pending",
            "created_at": Utc::now(),
            "username": request.username,
            "module_name": request.module_name,
            "optimizer_name": request.optimizer_name,
        })),
    ))
}

/// Validate and queue a grid search over model pairs.
async fn submit_grid(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let raw = raw_body(payload)?;
    let request: GridSearchRequest = parse_payload(&raw)?;

    if let Err(err) = state.executor.validate_grid(&request) {
        warn!("Grid payload validation failed: {err}");
        return Err(err.into());
    }

    let overview = grid_overview(&request);
    let job_id = create_and_enqueue(&state, JobType::GridSearch, raw, overview).await?;

    info!(
        "Enqueued grid-search job {job_id} for module={} ({} pairs)",
        request.module_name,
        request.total_pairs()
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "job_id": job_id,
            "job_type": JobType::GridSearch,
            "status": "pending",
            "created_at": Utc::now(),
            "username": request.username,
            "module_name": request.module_name,
            "optimizer_name": request.optimizer_name,
        })),
    ))
}
