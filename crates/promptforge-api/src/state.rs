use std::sync::Arc;
use std::time::Duration;

use promptforge_core::{Executor, JobStore, WorkerPool};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub pool: Arc<WorkerPool>,
    pub executor: Arc<dyn Executor>,
    /// Maximum worker silence before /health reports the pool stuck.
    pub stale_threshold: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        executor: Arc<dyn Executor>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            executor,
            stale_threshold,
        }
    }
}
