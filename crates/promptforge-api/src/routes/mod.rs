pub mod health;
pub mod jobs;
pub mod queue;
pub mod submit;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Assemble the full API router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router())
        .merge(submit::router())
        .merge(jobs::router())
        .merge(queue::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
