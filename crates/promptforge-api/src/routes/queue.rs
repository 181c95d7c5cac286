use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/queue", get(queue_status))
}

/// Scheduler introspection: queue depth and worker health.
async fn queue_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "pending_jobs": state.pool.queue_size(),
        "active_jobs": state.pool.active_jobs(),
        "worker_threads": state.pool.thread_count(),
        "workers_alive": state.pool.workers_alive(),
    }))
}
