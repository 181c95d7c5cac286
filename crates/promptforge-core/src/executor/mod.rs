//! The contract between the control plane and the optimization engine.
//!
//! The engine is an external collaborator: the core never inspects how an
//! optimization runs, it only validates payloads up front and consumes the
//! progress-callback/result contract. Implementations are passed in at
//! construction; there is no process-global registry.

pub mod demo;

pub use demo::DemoExecutor;

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{GridSearchRequest, GridSearchResponse, RunRequest, RunResponse};

/// Receiver for progress events emitted while an optimization runs.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &str, metrics: &Map<String, Value>);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, &Map<String, Value>) + Send + Sync,
{
    fn emit(&self, event: &str, metrics: &Map<String, Value>) {
        self(event, metrics)
    }
}

/// The optimization engine as the control plane sees it.
///
/// `validate`/`validate_grid` run on the worker before the subprocess is
/// spawned, so a malformed payload never pays the launch cost. The run
/// methods execute on the child process's main thread and may block for the
/// whole optimization; any returned error's message and debug rendering
/// become the job's failure detail.
pub trait Executor: Send + Sync {
    /// Check the payload against the configured assets. Returns
    /// `Error::Validation` when the payload requires user action.
    fn validate(&self, payload: &RunRequest) -> Result<()>;

    /// Grid-search analogue of [`Executor::validate`].
    fn validate_grid(&self, payload: &GridSearchRequest) -> Result<()>;

    /// Execute one optimization run. `artifact_id` equals the job id.
    fn run(
        &self,
        payload: &RunRequest,
        artifact_id: &str,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<RunResponse>;

    /// Execute a grid search; the response carries per-pair sub-results
    /// including per-pair error messages.
    fn run_grid(
        &self,
        payload: &GridSearchRequest,
        artifact_id: &str,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<GridSearchResponse>;

    /// Registered assets, surfaced by the health endpoint.
    fn snapshot(&self) -> BTreeMap<String, Vec<String>>;
}
