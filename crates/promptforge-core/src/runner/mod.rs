//! Job execution runners.
//!
//! Every job that reaches `running` executes through a [`JobRunner`]. The
//! production implementation ([`SubprocessRunner`]) launches one fresh child
//! process per job and consumes a typed event stream from it; the child may
//! hold arbitrary model state, leak, or crash without taking the service
//! down, and termination is a bounded OS-level operation.
//!
//! The wire protocol is one JSON [`ChildRequest`] document on the child's
//! stdin, then newline-delimited JSON [`ChildEvent`]s on its stdout. Stdout
//! is the per-job event queue: single producer (child), single consumer
//! (the owning worker).

pub mod child;
pub mod local;

pub use child::run_child;
pub use local::LocalRunner;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::models::JobType;
use crate::repository::JobStore;

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(3);

/// Grace period between SIGKILL and giving up.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to keep draining the event stream after the child was reaped.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How much trailing stderr to keep for synthesized failure messages.
const STDERR_TAIL_BYTES: usize = 4096;

/// Request document handed to the child on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRequest {
    pub job_id: String,
    pub job_type: JobType,
    pub payload: Value,
}

/// One event on the child's stdout stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildEvent {
    Progress {
        event: String,
        #[serde(default)]
        metrics: Map<String, Value>,
    },
    Log {
        timestamp: DateTime<Utc>,
        level: String,
        logger: String,
        message: String,
    },
    Result {
        result: Value,
    },
    Error {
        message: String,
        #[serde(default)]
        traceback: String,
    },
}

/// How a run ended, as seen by the worker loop.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The child reported a result.
    Completed(Value),

    /// The child reported an error, or died without reporting anything.
    Failed {
        message: String,
        traceback: Option<String>,
    },

    /// The cancel flag fired and the run was terminated.
    Cancelled,
}

/// Everything a runner needs to drive one job.
pub struct RunContext {
    pub job_id: String,
    pub job_type: JobType,
    pub payload: Value,
    pub store: Arc<dyn JobStore>,
    pub cancel: Arc<AtomicBool>,
    /// Called on every drained event and poll tick to feed liveness.
    pub on_activity: Arc<dyn Fn() + Send + Sync>,
}

impl RunContext {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Drives one job to completion, forwarding telemetry into the store.
///
/// Runners never fail the worker loop for routine child failures; those come
/// back through [`RunOutcome`] so the worker can write the right terminal
/// status.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: RunContext) -> Result<RunOutcome>;
}

/// Program and arguments used to launch job child processes.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ChildCommand {
    /// Re-execute the current binary with the hidden `run-job` argument.
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["run-job".to_string()],
        })
    }
}

/// Spawns one child process per job and streams its events into the store.
pub struct SubprocessRunner {
    command: ChildCommand,
    cancel_poll_interval: Duration,
}

enum Termination {
    None,
    Termed(Instant),
    Killed(Instant),
    Abandoned,
}

impl SubprocessRunner {
    pub fn new(command: ChildCommand, cancel_poll_interval: Duration) -> Self {
        Self {
            command,
            cancel_poll_interval,
        }
    }

    /// Forward one drained event; store failures must not fail the job.
    async fn forward_event(
        ctx: &RunContext,
        event: ChildEvent,
        result: &mut Option<Value>,
        failure: &mut Option<(String, String)>,
    ) {
        match event {
            ChildEvent::Progress { event, metrics } => {
                debug!("Job {} progress: {event}", ctx.job_id);
                if let Err(err) = ctx
                    .store
                    .record_progress(&ctx.job_id, Some(&event), &metrics)
                    .await
                {
                    warn!("Job {}: failed to record progress: {err}", ctx.job_id);
                }
            }
            ChildEvent::Log {
                timestamp,
                level,
                logger,
                message,
            } => {
                if let Err(err) = ctx
                    .store
                    .append_log(&ctx.job_id, &level, &logger, &message, Some(timestamp))
                    .await
                {
                    warn!("Job {}: failed to append log: {err}", ctx.job_id);
                }
            }
            ChildEvent::Result { result: value } => {
                *result = Some(value);
            }
            ChildEvent::Error { message, traceback } => {
                *failure = Some((message, traceback));
            }
        }
    }

    /// Advance the termination ladder one step.
    fn escalate(child: &mut Child, job_id: &str, state: Termination) -> Termination {
        match state {
            Termination::None => {
                debug!("Job {job_id}: cancel observed, terminating child");
                soft_terminate(child);
                Termination::Termed(Instant::now())
            }
            Termination::Termed(at) if at.elapsed() >= TERM_GRACE => {
                warn!("Job {job_id}: child ignored SIGTERM, killing");
                if let Err(err) = child.start_kill() {
                    warn!("Job {job_id}: kill failed: {err}");
                }
                Termination::Killed(Instant::now())
            }
            Termination::Killed(at) if at.elapsed() >= KILL_GRACE => {
                error!("Job {job_id}: child survived SIGKILL");
                Termination::Abandoned
            }
            other => other,
        }
    }
}

#[cfg(unix)]
fn soft_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn soft_terminate(child: &Child) {
    // No SIGTERM equivalent; the next ladder step hard-kills.
    let _ = child;
}

#[async_trait]
impl JobRunner for SubprocessRunner {
    async fn run(&self, ctx: RunContext) -> Result<RunOutcome> {
        let request = ChildRequest {
            job_id: ctx.job_id.clone(),
            job_type: ctx.job_type,
            payload: ctx.payload.clone(),
        };

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // A child that dies immediately closes the pipe; the exit-status
        // fallback below reports that, so a failed write is not fatal here.
        let mut stdin = child.stdin.take().expect("child stdin was piped");
        if let Err(err) = stdin.write_all(&serde_json::to_vec(&request)?).await {
            warn!("Job {}: failed to hand payload to child: {err}", ctx.job_id);
        }
        let _ = stdin.shutdown().await;
        drop(stdin);

        let stdout = child.stdout.take().expect("child stdout was piped");
        let (tx, mut rx) = mpsc::channel::<ChildEvent>(256);
        let job_id = ctx.job_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ChildEvent>(&line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Job {job_id}: undecodable child event: {err}"),
                }
            }
        });

        let stderr = child.stderr.take().expect("child stderr was piped");
        let stderr_tail = tokio::spawn(async move {
            let mut buffer = Vec::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_end(&mut buffer).await;
            let start = buffer.len().saturating_sub(STDERR_TAIL_BYTES);
            String::from_utf8_lossy(&buffer[start..]).into_owned()
        });

        let mut result: Option<Value> = None;
        let mut failure: Option<(String, String)> = None;
        let mut termination = Termination::None;
        let mut exit_status: Option<std::process::ExitStatus> = None;
        let mut reaped_at: Option<Instant> = None;
        let mut stream_done = false;
        let mut abandoned = false;

        // Poll loop: drain the event stream, tick the cancel flag, and reap
        // the child. The stream reaching EOF and the child being reaped are
        // independent conditions; both must hold before moving on. A
        // grandchild inheriting the pipe can keep the stream open past the
        // child's exit, so the post-exit drain is time-bounded. The tick
        // deadline is fixed outside the select so a dense event stream
        // cannot starve the cancel poll.
        let mut next_tick = tokio::time::Instant::now() + self.cancel_poll_interval;
        while !(stream_done && exit_status.is_some()) {
            tokio::select! {
                maybe_event = rx.recv(), if !stream_done => match maybe_event {
                    Some(event) => {
                        (ctx.on_activity)();
                        Self::forward_event(&ctx, event, &mut result, &mut failure).await;
                    }
                    None => stream_done = true,
                },
                _ = tokio::time::sleep_until(next_tick) => {}
            }

            if tokio::time::Instant::now() >= next_tick {
                next_tick = tokio::time::Instant::now() + self.cancel_poll_interval;
                (ctx.on_activity)();
                if exit_status.is_none() {
                    exit_status = child.try_wait()?;
                    if exit_status.is_some() {
                        reaped_at = Some(Instant::now());
                    }
                }
                if let Some(at) = reaped_at {
                    if at.elapsed() >= EXIT_DRAIN_GRACE {
                        break;
                    }
                }
                if ctx.cancelled() && exit_status.is_none() {
                    termination = Self::escalate(&mut child, &ctx.job_id, termination);
                    if matches!(termination, Termination::Abandoned) {
                        abandoned = true;
                        break;
                    }
                }
            }
        }

        // Pick up anything the reader buffered before we stopped listening.
        while let Ok(event) = rx.try_recv() {
            Self::forward_event(&ctx, event, &mut result, &mut failure).await;
        }

        if let Some((message, traceback)) = failure {
            return Ok(RunOutcome::Failed {
                message,
                traceback: Some(traceback),
            });
        }
        if let Some(value) = result {
            return Ok(RunOutcome::Completed(value));
        }
        if ctx.cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        // No result, no error: synthesize a failure from the exit status.
        // The stderr read is time-bounded for the same grandchild reason as
        // the event stream.
        let tail = if abandoned {
            String::new()
        } else {
            tokio::time::timeout(EXIT_DRAIN_GRACE, stderr_tail)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .unwrap_or_default()
        };
        let mut message = match exit_status.and_then(|s| s.code()) {
            Some(code) => format!("Job process exited with status {code} before reporting a result"),
            None => "Job process was terminated by a signal before reporting a result".to_string(),
        };
        if !tail.trim().is_empty() {
            message.push_str(&format!(": {}", tail.trim()));
        }
        Ok(RunOutcome::Failed {
            message,
            traceback: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteJobStore;
    use serde_json::json;

    fn shell_command(script: &str) -> ChildCommand {
        ChildCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    async fn context_for(
        store: Arc<dyn JobStore>,
        job_id: &str,
        cancelled: bool,
    ) -> RunContext {
        RunContext {
            job_id: job_id.to_string(),
            job_type: JobType::Run,
            payload: json!({}),
            store,
            cancel: Arc::new(AtomicBool::new(cancelled)),
            on_activity: Arc::new(|| {}),
        }
    }

    async fn temp_store() -> (tempfile::TempDir, Arc<dyn JobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let store = SqliteJobStore::connect(path.to_str().unwrap()).await.unwrap();
        (dir, Arc::new(store))
    }

    #[test]
    fn test_child_event_roundtrip() {
        let event = ChildEvent::Progress {
            event: "optimizer_progress".to_string(),
            metrics: json!({"tqdm_n": 3}).as_object().unwrap().clone(),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"type\":\"progress\""));
        let back: ChildEvent = serde_json::from_str(&line).unwrap();
        match back {
            ChildEvent::Progress { event, metrics } => {
                assert_eq!(event, "optimizer_progress");
                assert_eq!(metrics.get("tqdm_n"), Some(&json!(3)));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_synthesizes_failure() {
        let (_dir, store) = temp_store().await;
        store.create_job("job-1").await.unwrap();
        let runner = SubprocessRunner::new(
            shell_command("cat > /dev/null; echo boom >&2; exit 3"),
            Duration::from_millis(50),
        );
        let ctx = context_for(store, "job-1", false).await;
        let outcome = runner.run(ctx).await.unwrap();
        match outcome {
            RunOutcome::Failed { message, traceback } => {
                assert!(message.contains("status 3"), "message: {message}");
                assert!(message.contains("boom"));
                assert!(traceback.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_result_event_completes() {
        let (_dir, store) = temp_store().await;
        store.create_job("job-1").await.unwrap();
        let script = r#"cat > /dev/null
echo '{"type":"progress","event":"baseline_evaluated","metrics":{"baseline_test_metric":0.5}}'
echo '{"type":"result","result":{"metric_name":"metric"}}'
"#;
        let runner = SubprocessRunner::new(shell_command(script), Duration::from_millis(50));
        let ctx = context_for(store.clone(), "job-1", false).await;
        let outcome = runner.run(ctx).await.unwrap();
        match outcome {
            RunOutcome::Completed(result) => {
                assert_eq!(result["metric_name"], json!("metric"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(store.get_progress_count("job-1").await.unwrap(), 1);
        let record = store.get_job("job-1").await.unwrap();
        assert_eq!(
            record.latest_metrics.get("baseline_test_metric"),
            Some(&json!(0.5))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let (_dir, store) = temp_store().await;
        store.create_job("job-1").await.unwrap();
        let runner = SubprocessRunner::new(
            shell_command("cat > /dev/null; sleep 30"),
            Duration::from_millis(50),
        );
        let ctx = context_for(store, "job-1", true).await;
        let started = Instant::now();
        let outcome = runner.run(ctx).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_log_events_reach_store() {
        let (_dir, store) = temp_store().await;
        store.create_job("job-1").await.unwrap();
        let script = r#"cat > /dev/null
echo '{"type":"log","timestamp":"2026-01-01T00:00:00Z","level":"ERROR","logger":"optimizer","message":"it broke"}'
echo '{"type":"error","message":"it broke","traceback":"trace"}'
exit 1
"#;
        let runner = SubprocessRunner::new(shell_command(script), Duration::from_millis(50));
        let ctx = context_for(store.clone(), "job-1", false).await;
        let outcome = runner.run(ctx).await.unwrap();
        match outcome {
            RunOutcome::Failed { message, traceback } => {
                assert_eq!(message, "it broke");
                assert_eq!(traceback.as_deref(), Some("trace"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            store.get_log_count("job-1", Some("ERROR")).await.unwrap(),
            1
        );
    }
}
