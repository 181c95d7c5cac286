//! The worker pool.
//!
//! Scheduler state (pending FIFO, processing set, cancel flags) lives under
//! a single mutex held only for short critical sections, never across I/O.
//! Workers are long-lived tokio tasks; a worker owns a job id from the
//! moment it pops it off the queue until the terminal state is persisted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::executor::Executor;
use crate::jobs::{JobError, MSG_CANCELLED, MSG_RUNNING, MSG_SUCCESS, MSG_VALIDATING};
use crate::models::{GridSearchRequest, JobStatus, JobType, RunRequest};
use crate::repository::{JobStore, JobUpdate};
use crate::runner::{JobRunner, RunContext, RunOutcome};

/// Idle cycles between heartbeat activity touches.
const IDLE_HEARTBEAT_CYCLES: u64 = 150;

/// Pool sizing and pacing.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs_f64(2.0),
        }
    }
}

impl From<&crate::config::WorkerConfig> for WorkerSettings {
    fn from(config: &crate::config::WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            poll_interval: config.poll_interval,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    pending: VecDeque<String>,
    processing: HashSet<String>,
    cancel_flags: HashMap<String, Arc<AtomicBool>>,
}

struct PoolShared {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    runner: Arc<dyn JobRunner>,
    settings: WorkerSettings,
    running: AtomicBool,
    sched: Mutex<SchedulerState>,
    activity: Mutex<HashMap<usize, Instant>>,
}

impl PoolShared {
    fn touch_activity(&self, worker_id: usize) {
        let mut activity = self.activity.lock().expect("activity lock poisoned");
        activity.insert(worker_id, Instant::now());
    }

    fn next_job(&self) -> Option<String> {
        let mut sched = self.sched.lock().expect("scheduler lock poisoned");
        let job_id = sched.pending.pop_front()?;
        sched.processing.insert(job_id.clone());
        Some(job_id)
    }

    fn mark_job_done(&self, job_id: &str) {
        let mut sched = self.sched.lock().expect("scheduler lock poisoned");
        sched.processing.remove(job_id);
        sched.cancel_flags.remove(job_id);
    }

    fn cancel_flag(&self, job_id: &str) -> Arc<AtomicBool> {
        let mut sched = self.sched.lock().expect("scheduler lock poisoned");
        Arc::clone(
            sched
                .cancel_flags
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    fn is_cancelled(&self, job_id: &str) -> bool {
        let sched = self.sched.lock().expect("scheduler lock poisoned");
        sched
            .cancel_flags
            .get(job_id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Fixed-size pool of worker tasks fed by an in-memory FIFO.
///
/// The pool takes its dependencies explicitly; the application context owns
/// its lifetime and a dead pool surfaces through the health check rather
/// than healing itself.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn Executor>,
        runner: Arc<dyn JobRunner>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                store,
                executor,
                runner,
                settings,
                running: AtomicBool::new(false),
                sched: Mutex::new(SchedulerState::default()),
                activity: Mutex::new(HashMap::new()),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock().expect("handles lock poisoned");
        for worker_id in 0..self.shared.settings.concurrency.max(1) {
            let shared = Arc::clone(&self.shared);
            handles.push(tokio::spawn(worker_loop(shared, worker_id)));
        }
        info!("Started {} background workers", handles.len());
    }

    /// Add a job id to the queue if it is not already queued or owned by a
    /// worker, and create its cancel flag.
    pub fn enqueue_job(&self, job_id: &str) {
        let mut sched = self.shared.sched.lock().expect("scheduler lock poisoned");
        if sched.pending.iter().any(|id| id == job_id) || sched.processing.contains(job_id) {
            return;
        }
        sched.pending.push_back(job_id.to_string());
        sched
            .cancel_flags
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));
        info!("Job {job_id} added to queue");
    }

    /// Persist the payload onto the job row, then enqueue it.
    pub async fn submit_job(
        &self,
        job_id: &str,
        job_type: JobType,
        payload: Value,
    ) -> crate::Result<()> {
        self.shared
            .store
            .update_job(
                job_id,
                JobUpdate::new().job_type(job_type).payload(payload),
            )
            .await?;
        self.enqueue_job(job_id);
        Ok(())
    }

    /// Set the cancel flag. A job still waiting in the queue is removed
    /// immediately (its worker cleanup will never run). Returns whether the
    /// job was known to the scheduler.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let mut sched = self.shared.sched.lock().expect("scheduler lock poisoned");
        let Some(flag) = sched.cancel_flags.get(job_id) else {
            return false;
        };
        flag.store(true, Ordering::SeqCst);
        if let Some(position) = sched.pending.iter().position(|id| id == job_id) {
            sched.pending.remove(position);
            sched.cancel_flags.remove(job_id);
        }
        info!("Job {job_id} signalled for cancellation");
        true
    }

    pub fn queue_size(&self) -> usize {
        let sched = self.shared.sched.lock().expect("scheduler lock poisoned");
        sched.pending.len()
    }

    pub fn active_jobs(&self) -> usize {
        let sched = self.shared.sched.lock().expect("scheduler lock poisoned");
        sched.processing.len()
    }

    pub fn thread_count(&self) -> usize {
        self.handles.lock().expect("handles lock poisoned").len()
    }

    /// True while every worker task is alive.
    pub fn workers_alive(&self) -> bool {
        let handles = self.handles.lock().expect("handles lock poisoned");
        !handles.is_empty() && handles.iter().all(|handle| !handle.is_finished())
    }

    /// Time since the most recent activity across all workers.
    pub fn seconds_since_last_activity(&self) -> Option<f64> {
        let activity = self.shared.activity.lock().expect("activity lock poisoned");
        activity
            .values()
            .max()
            .map(|latest| latest.elapsed().as_secs_f64())
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Stop accepting work, flag every in-flight job, and join the workers
    /// with an equal share of the timeout budget each.
    pub async fn stop(&self, timeout: Duration) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut sched = self.shared.sched.lock().expect("scheduler lock poisoned");
            sched.pending.clear();
            for flag in sched.cancel_flags.values() {
                flag.store(true, Ordering::SeqCst);
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().expect("handles lock poisoned");
            handles.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        let share = timeout / handles.len() as u32;
        for handle in handles {
            if tokio::time::timeout(share, handle).await.is_err() {
                warn!("Worker did not stop within its timeout share");
            }
        }
        info!("Stopped background workers");
    }
}

async fn worker_loop(shared: Arc<PoolShared>, worker_id: usize) {
    info!("Worker {worker_id} started");
    shared.touch_activity(worker_id);
    let mut idle_cycles: u64 = 0;

    // Job failures come back as values and are converted to terminal writes
    // below; a panic would end this task and trip the health check.
    while shared.is_running() {
        let Some(job_id) = shared.next_job() else {
            tokio::time::sleep(shared.settings.poll_interval).await;
            idle_cycles += 1;
            if idle_cycles % IDLE_HEARTBEAT_CYCLES == 0 {
                debug!("Worker {worker_id} heartbeat, idle cycles: {idle_cycles}");
                shared.touch_activity(worker_id);
            }
            continue;
        };

        idle_cycles = 0;
        shared.touch_activity(worker_id);
        run_job(&shared, worker_id, &job_id).await;
        shared.mark_job_done(&job_id);
    }

    info!("Worker {worker_id} stopped");
}

/// Drive one job and persist exactly one terminal state.
async fn run_job(shared: &Arc<PoolShared>, worker_id: usize, job_id: &str) {
    let result = process_job(shared, worker_id, job_id).await;

    let (status, message) = match result {
        Ok(()) => return,
        Err(JobError::Cancelled) => {
            if shared.is_running() {
                (JobStatus::Cancelled, MSG_CANCELLED.to_string())
            } else {
                // The flag was set by shutdown, not by a user.
                (
                    JobStatus::Failed,
                    "Job interrupted by service shutdown: worker pool is stopping".to_string(),
                )
            }
        }
        Err(err) => {
            error!("Job {job_id} failed: {err}");
            (JobStatus::Failed, err.to_string())
        }
    };

    let update = JobUpdate::new()
        .status(status)
        .message(message)
        .completed_at(Utc::now());
    if let Err(err) = shared.store.update_job(job_id, update).await {
        error!("Job {job_id}: failed to write terminal status: {err}");
    }
}

async fn process_job(
    shared: &Arc<PoolShared>,
    worker_id: usize,
    job_id: &str,
) -> Result<(), JobError> {
    info!("Processing job {job_id}");

    if shared.is_cancelled(job_id) {
        return Err(JobError::Cancelled);
    }

    let record = shared.store.get_job(job_id).await?;
    let payload = record
        .payload
        .ok_or_else(|| JobError::MissingPayload(format!("Job {job_id} has no payload")))?;

    shared
        .store
        .update_job(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Validating)
                .message(MSG_VALIDATING),
        )
        .await?;

    // A validation failure is `failed`, not `cancelled`: the payload is
    // malformed in a way only the user can fix.
    match record.job_type {
        JobType::Run => {
            let parsed: RunRequest = serde_json::from_value(payload.clone())
                .map_err(|err| JobError::Validation(format!("Invalid stored payload: {err}")))?;
            shared
                .executor
                .validate(&parsed)
                .map_err(|err| JobError::Validation(err.to_string()))?;
        }
        JobType::GridSearch => {
            let parsed: GridSearchRequest = serde_json::from_value(payload.clone())
                .map_err(|err| JobError::Validation(format!("Invalid stored payload: {err}")))?;
            shared
                .executor
                .validate_grid(&parsed)
                .map_err(|err| JobError::Validation(err.to_string()))?;
        }
    }

    if shared.is_cancelled(job_id) {
        return Err(JobError::Cancelled);
    }

    shared
        .store
        .update_job(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Running)
                .message(MSG_RUNNING)
                .started_at(Utc::now()),
        )
        .await?;

    let on_activity: Arc<dyn Fn() + Send + Sync> = {
        let shared = Arc::downgrade(shared);
        Arc::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.touch_activity(worker_id);
            }
        })
    };
    let ctx = RunContext {
        job_id: job_id.to_string(),
        job_type: record.job_type,
        payload,
        store: Arc::clone(&shared.store),
        cancel: shared.cancel_flag(job_id),
        on_activity,
    };
    let outcome = shared.runner.run(ctx).await?;

    match outcome {
        RunOutcome::Cancelled => Err(JobError::Cancelled),
        RunOutcome::Failed { message, traceback } => {
            // Surface the traceback through the job log before the terminal
            // write, so failed jobs always carry an ERROR entry.
            let detail = match &traceback {
                Some(traceback) => format!("Job failed: {message}\nTraceback:\n{traceback}"),
                None => format!("Job failed: {message}"),
            };
            if let Err(err) = shared
                .store
                .append_log(job_id, "ERROR", "promptforge.worker", &detail, None)
                .await
            {
                warn!("Job {job_id}: failed to append error log: {err}");
            }
            Err(JobError::Execution(message))
        }
        RunOutcome::Completed(result) => {
            // The run may have finished during a stretch with no progress
            // callbacks after cancel was requested.
            if shared.is_cancelled(job_id) {
                return Err(JobError::Cancelled);
            }

            if record.job_type == JobType::GridSearch {
                if let Some(failed_message) = grid_total_failure(&result) {
                    shared
                        .store
                        .update_job(
                            job_id,
                            JobUpdate::new()
                                .status(JobStatus::Failed)
                                .message(failed_message)
                                .completed_at(Utc::now())
                                .result(result),
                        )
                        .await?;
                    return Ok(());
                }
            }

            shared
                .store
                .update_job(
                    job_id,
                    JobUpdate::new()
                        .status(JobStatus::Success)
                        .message(MSG_SUCCESS)
                        .completed_at(Utc::now())
                        .result(result),
                )
                .await?;
            info!("Job {job_id} completed successfully");
            Ok(())
        }
    }
}

/// A grid run whose pairs all failed is a failed job; the pair table is
/// still stored so `/grid-result` can explain what happened.
fn grid_total_failure(result: &Value) -> Option<String> {
    let completed = result.get("completed_pairs").and_then(Value::as_u64)?;
    let failed = result.get("failed_pairs").and_then(Value::as_u64)?;
    if completed == 0 && failed > 0 {
        Some(format!("All {failed} optimization pairs failed"))
    } else {
        None
    }
}
