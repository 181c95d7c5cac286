//! HTTP control surface for the PromptForge job service.

pub mod error;
pub mod routes;
pub mod server;
pub mod state;
pub mod views;

pub use error::{ApiError, FieldIssue};
pub use routes::create_router;
pub use server::{build_state, run};
pub use state::AppState;
