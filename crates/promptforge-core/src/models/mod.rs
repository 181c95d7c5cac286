//! Domain and wire models shared by the store, the worker pool, and the API.

pub mod progress;
pub mod request;
pub mod response;

pub use progress::{ProgressSnapshot, format_hms};
pub use request::{ColumnMapping, GridSearchRequest, ModelSettings, RunRequest, SplitFractions};
pub use response::{
    GridSearchResponse, OptimizedDemo, OptimizedPredictor, PairResult, ProgramArtifact,
    RunResponse, SplitCounts,
};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Background job states, persisted as lowercase strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue
    Pending,

    /// A worker is validating the payload
    Validating,

    /// The optimization subprocess is running
    Running,

    /// Completed successfully
    Success,

    /// Completed with an error
    Failed,

    /// Cancelled by the user (or swept out of the queue)
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Validating => "validating",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "validating" => Some(JobStatus::Validating),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// The two kinds of jobs the service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Run,
    GridSearch,
}

impl Default for JobType {
    fn default() -> Self {
        JobType::Run
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Run => "run",
            JobType::GridSearch => "grid_search",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "run" => Some(JobType::Run),
            "grid_search" => Some(JobType::GridSearch),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Validating,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_str("exploded"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Validating.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&JobType::GridSearch).unwrap(),
            "\"grid_search\""
        );
        assert_eq!(JobType::from_str("grid_search"), Some(JobType::GridSearch));
    }
}
