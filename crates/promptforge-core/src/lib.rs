//! PromptForge core: job store, worker pool, subprocess runner, and the
//! executor contract for a prompt-optimization control plane.
//!
//! The HTTP surface lives in `promptforge-api`; this crate owns everything
//! behind it. Jobs are durable rows ([`repository::JobStore`]) scheduled by
//! a fixed worker pool ([`jobs::WorkerPool`]) that executes each run in an
//! isolated child process ([`runner::SubprocessRunner`]) and streams typed
//! progress, log, and result events back into the store.

pub mod config;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod models;
pub mod repository;
pub mod runner;

// Re-export commonly used types
pub use config::{ServiceConfig, StartMethod, StoreBackend, StoreConfig, WorkerConfig};
pub use error::{Error, Result};
pub use executor::{DemoExecutor, Executor, ProgressSink};
pub use jobs::{WorkerPool, WorkerSettings};
pub use models::{JobStatus, JobType};
pub use repository::{connect_store, JobRecord, JobStore, JobUpdate};
pub use runner::{ChildCommand, JobRunner, LocalRunner, SubprocessRunner};

/// Current version of promptforge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
