use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::error;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(healthcheck))
}

/// Readiness probe: reports registered assets, fails when the worker pool is
/// dead or has gone silent past the staleness threshold.
async fn healthcheck(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if !state.pool.workers_alive() {
        error!("Health check failed: worker threads are not alive");
        return Err(ApiError::Unavailable(
            "Worker threads are not running".to_string(),
        ));
    }

    if let Some(stale_seconds) = state.pool.seconds_since_last_activity() {
        if stale_seconds > state.stale_threshold.as_secs_f64() {
            error!("Health check failed: workers stuck for {stale_seconds:.0}s");
            return Err(ApiError::Unavailable(format!(
                "Worker threads stuck for {stale_seconds:.0}s"
            )));
        }
    }

    Ok(Json(json!({
        "status": "ok",
        "registered_assets": state.executor.snapshot(),
    })))
}
