//! Job store trait and the record types it traffics in.
//!
//! Two interchangeable backends implement this contract: the embedded
//! SQLite store (single writer, internal mutex) and the remote PostgreSQL
//! store (concurrency delegated to the database). Selection is a
//! configuration flag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{JobStatus, JobType};

/// Upper bound on stored progress events per job; oldest evicted on overflow.
pub const MAX_PROGRESS_EVENTS: i64 = 5000;

/// Upper bound on stored log entries per job; oldest evicted on overflow.
pub const MAX_LOG_ENTRIES: i64 = 5000;

/// One durable job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub job_type: JobType,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub latest_metrics: Map<String, Value>,
    pub result: Option<Value>,
    pub payload_overview: Map<String, Value>,
    pub payload: Option<Value>,
    /// Filled by list/detail queries in the same round-trip.
    pub progress_count: i64,
    pub log_count: i64,
}

/// Partial update applied by [`JobStore::update_job`].
///
/// `latest_metrics` is merged into the existing map, every other field
/// replaces the stored value. Fields left `None` are untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub latest_metrics: Option<Map<String, Value>>,
    pub result: Option<Value>,
    pub payload: Option<Value>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn latest_metrics(mut self, metrics: Map<String, Value>) -> Self {
        self.latest_metrics = Some(metrics);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.job_type.is_none()
            && self.message.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.latest_metrics.is_none()
            && self.result.is_none()
            && self.payload.is_none()
    }

    /// Strip the fields that are frozen once a job is terminal.
    pub(crate) fn without_terminal_fields(mut self) -> Self {
        self.status = None;
        self.message = None;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        self
    }
}

/// One stored progress event.
#[derive(Debug, Clone)]
pub struct ProgressEventRecord {
    pub timestamp: DateTime<Utc>,
    pub event: Option<String>,
    pub metrics: Map<String, Value>,
}

/// One stored log entry.
#[derive(Debug, Clone)]
pub struct LogEntryRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub logger: String,
    pub message: String,
}

/// Filters for job listing; all present filters compose with AND.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<JobStatus>,
    pub username: Option<String>,
    pub job_type: Option<JobType>,
    pub limit: i64,
    pub offset: i64,
}

/// Pagination and filtering for log retrieval.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// `None` returns all entries.
    pub limit: Option<i64>,
    pub offset: i64,
    /// Case-insensitive level match.
    pub level: Option<String>,
}

/// Durable persistence for jobs, progress events, and logs.
///
/// Every operation is atomic with respect to concurrent callers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a fresh `pending` row. Fails with `Conflict` on duplicate id.
    async fn create_job(&self, job_id: &str) -> Result<JobRecord>;

    /// Apply a partial update. No-op if the job does not exist. Fields
    /// frozen by a terminal status are silently dropped.
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<()>;

    /// Fetch the full row. Fails with `NotFound` if absent.
    async fn get_job(&self, job_id: &str) -> Result<JobRecord>;

    async fn job_exists(&self, job_id: &str) -> Result<bool>;

    /// Remove the job and all dependent progress events and log entries.
    async fn delete_job(&self, job_id: &str) -> Result<()>;

    /// Append a progress event and merge `metrics` into the job's
    /// `latest_metrics` in the same transaction, evicting the oldest event
    /// past the per-job cap. No-op if the job has been deleted.
    async fn record_progress(
        &self,
        job_id: &str,
        event: Option<&str>,
        metrics: &Map<String, Value>,
    ) -> Result<()>;

    /// Chronologically ordered events for the job.
    async fn get_progress_events(&self, job_id: &str) -> Result<Vec<ProgressEventRecord>>;

    async fn get_progress_count(&self, job_id: &str) -> Result<i64>;

    /// Append a log entry, evicting the oldest past the per-job cap.
    /// Silently drops the entry when the job no longer exists (the worker
    /// may emit a final log after a cancel deleted the job).
    async fn append_log(
        &self,
        job_id: &str,
        level: &str,
        logger_name: &str,
        message: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Chronologically ordered, level-filtered, paginated log entries.
    async fn get_logs(&self, job_id: &str, query: &LogQuery) -> Result<Vec<LogEntryRecord>>;

    async fn get_log_count(&self, job_id: &str, level: Option<&str>) -> Result<i64>;

    /// Replace the overview map wholesale; refreshes the denormalized
    /// username column used for indexed filtering.
    async fn set_payload_overview(&self, job_id: &str, overview: &Map<String, Value>)
        -> Result<()>;

    /// Jobs ordered by `created_at` descending, with per-row progress and
    /// log counts computed in the same round-trip.
    async fn list_jobs(&self, filter: &ListFilter) -> Result<Vec<JobRecord>>;

    async fn count_jobs(&self, filter: &ListFilter) -> Result<i64>;

    /// Startup recovery: rewrite every `running`/`validating` row left by a
    /// previous process to `failed`. Returns the number of rows rewritten.
    async fn recover_orphaned_jobs(&self) -> Result<u64>;

    /// Startup recovery: ids of `pending` jobs, oldest first, for the
    /// worker pool to re-enqueue.
    async fn recover_pending_jobs(&self) -> Result<Vec<String>>;
}

/// Message written onto jobs recovered by [`JobStore::recover_orphaned_jobs`].
pub const ORPHAN_RECOVERY_MESSAGE: &str = "Job interrupted by service restart";
