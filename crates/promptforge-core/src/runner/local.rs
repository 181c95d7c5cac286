//! In-process runner.
//!
//! Runs the executor on a blocking thread of the service process itself, the
//! way a fork-started child would inherit the parent's executor. There is no
//! process isolation and no preemptive termination: on cancel the runner
//! stops listening and reports `Cancelled`, while the blocking task runs to
//! completion in the background with its events discarded. Production
//! deployments should prefer [`super::SubprocessRunner`]; this runner exists
//! for embedders and tests.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::executor::{Executor, ProgressSink};
use crate::models::JobType;
use crate::runner::{ChildEvent, JobRunner, RunContext, RunOutcome};

pub struct LocalRunner {
    executor: Arc<dyn Executor>,
    cancel_poll_interval: std::time::Duration,
}

impl LocalRunner {
    pub fn new(executor: Arc<dyn Executor>, cancel_poll_interval: std::time::Duration) -> Self {
        Self {
            executor,
            cancel_poll_interval,
        }
    }
}

struct ChannelSink(mpsc::UnboundedSender<ChildEvent>);

impl ProgressSink for ChannelSink {
    fn emit(&self, event: &str, metrics: &Map<String, Value>) {
        // Receiver gone means the run was abandoned; drop the event.
        let _ = self.0.send(ChildEvent::Progress {
            event: event.to_string(),
            metrics: metrics.clone(),
        });
    }
}

fn execute(
    executor: &dyn Executor,
    job_type: JobType,
    payload: &Value,
    artifact_id: &str,
    sink: &ChannelSink,
) -> anyhow::Result<Value> {
    match job_type {
        JobType::Run => {
            let payload = serde_json::from_value(payload.clone())?;
            let response = executor.run(&payload, artifact_id, sink)?;
            Ok(serde_json::to_value(response)?)
        }
        JobType::GridSearch => {
            let payload = serde_json::from_value(payload.clone())?;
            let response = executor.run_grid(&payload, artifact_id, sink)?;
            Ok(serde_json::to_value(response)?)
        }
    }
}

#[async_trait]
impl JobRunner for LocalRunner {
    async fn run(&self, ctx: RunContext) -> crate::Result<RunOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChildEvent>();
        let executor = Arc::clone(&self.executor);
        let job_type = ctx.job_type;
        let payload = ctx.payload.clone();
        let artifact_id = ctx.job_id.clone();

        tokio::task::spawn_blocking(move || {
            let sink = ChannelSink(tx.clone());
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                execute(executor.as_ref(), job_type, &payload, &artifact_id, &sink)
            }));
            let event = match outcome {
                Ok(Ok(result)) => ChildEvent::Result { result },
                Ok(Err(err)) => ChildEvent::Error {
                    message: err.to_string(),
                    traceback: format!("{err:?}"),
                },
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "optimization panicked".to_string());
                    ChildEvent::Error {
                        traceback: format!("panic: {message}"),
                        message,
                    }
                }
            };
            let _ = tx.send(event);
        });

        let mut result: Option<Value> = None;
        let mut failure: Option<(String, String)> = None;
        // Fixed tick deadline, so steady event traffic cannot starve the
        // cancel poll.
        let mut next_tick = tokio::time::Instant::now() + self.cancel_poll_interval;
        loop {
            let mut stream_done = false;
            tokio::select! {
                maybe_event = rx.recv() => match maybe_event {
                    Some(ChildEvent::Progress { event, metrics }) => {
                        (ctx.on_activity)();
                        if let Err(err) = ctx
                            .store
                            .record_progress(&ctx.job_id, Some(&event), &metrics)
                            .await
                        {
                            warn!("Job {}: failed to record progress: {err}", ctx.job_id);
                        }
                    }
                    Some(ChildEvent::Log { timestamp, level, logger, message }) => {
                        if let Err(err) = ctx
                            .store
                            .append_log(&ctx.job_id, &level, &logger, &message, Some(timestamp))
                            .await
                        {
                            warn!("Job {}: failed to append log: {err}", ctx.job_id);
                        }
                    }
                    Some(ChildEvent::Result { result: value }) => result = Some(value),
                    Some(ChildEvent::Error { message, traceback }) => {
                        failure = Some((message, traceback));
                    }
                    None => stream_done = true,
                },
                _ = tokio::time::sleep_until(next_tick) => {}
            }

            if stream_done {
                break;
            }
            if tokio::time::Instant::now() >= next_tick {
                next_tick = tokio::time::Instant::now() + self.cancel_poll_interval;
                (ctx.on_activity)();
                if ctx.cancel.load(std::sync::atomic::Ordering::SeqCst) {
                    warn!(
                        "Job {}: cancelled in-process; the running optimization cannot be \
                         preempted and will be abandoned",
                        ctx.job_id
                    );
                    return Ok(RunOutcome::Cancelled);
                }
            }
        }

        if let Some((message, traceback)) = failure {
            return Ok(RunOutcome::Failed {
                message,
                traceback: Some(traceback),
            });
        }
        if let Some(value) = result {
            if ctx.cancel.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok(RunOutcome::Cancelled);
            }
            return Ok(RunOutcome::Completed(value));
        }
        Ok(RunOutcome::Failed {
            message: "Optimization ended without reporting a result".to_string(),
            traceback: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DemoExecutor;
    use crate::repository::{JobStore, SqliteJobStore};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    async fn temp_store() -> (tempfile::TempDir, Arc<dyn JobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let store = SqliteJobStore::connect(path.to_str().unwrap()).await.unwrap();
        (dir, Arc::new(store))
    }

    fn run_payload() -> Value {
        json!({
            "username": "alice",
            "module_name": "predict",
            "signature_code": "question -> answer",
            "metric_code": "def metric(example, pred):\n    return 1.0\n",
            "optimizer_name": "bootstrap_few_shot",
            "dataset": [{"q": "a", "a": "1"}],
            "column_mapping": {"inputs": {"question": "q"}, "outputs": {"answer": "a"}},
            "split_fractions": {"train": 1.0, "val": 0.0, "test": 0.0},
            "model_config": {"name": "openai/gpt-4o-mini"}
        })
    }

    fn context(store: Arc<dyn JobStore>, payload: Value, cancel: Arc<AtomicBool>) -> RunContext {
        RunContext {
            job_id: "job-1".to_string(),
            job_type: JobType::Run,
            payload,
            store,
            cancel,
            on_activity: Arc::new(|| {}),
        }
    }

    #[tokio::test]
    async fn test_local_runner_completes() {
        let (_dir, store) = temp_store().await;
        store.create_job("job-1").await.unwrap();
        let runner = LocalRunner::new(Arc::new(DemoExecutor::new()), Duration::from_millis(50));
        let ctx = context(
            store.clone(),
            run_payload(),
            Arc::new(AtomicBool::new(false)),
        );
        let outcome = runner.run(ctx).await.unwrap();
        match outcome {
            RunOutcome::Completed(result) => {
                assert_eq!(result["metric_name"], json!("metric"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(store.get_progress_count("job-1").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_local_runner_reports_executor_failure() {
        let (_dir, store) = temp_store().await;
        store.create_job("job-1").await.unwrap();
        let mut payload = run_payload();
        payload["module_kwargs"] = json!({"fail_with": "Dataset column mismatch"});
        let runner = LocalRunner::new(Arc::new(DemoExecutor::new()), Duration::from_millis(50));
        let ctx = context(store.clone(), payload, Arc::new(AtomicBool::new(false)));
        let outcome = runner.run(ctx).await.unwrap();
        match outcome {
            RunOutcome::Failed { message, traceback } => {
                assert!(message.contains("column mismatch"));
                assert!(traceback.unwrap().contains("column mismatch"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_runner_observes_cancel() {
        let (_dir, store) = temp_store().await;
        store.create_job("job-1").await.unwrap();
        let mut payload = run_payload();
        payload["module_kwargs"] = json!({"sleep_seconds": 3.0});
        let runner = LocalRunner::new(Arc::new(DemoExecutor::new()), Duration::from_millis(50));
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = context(store, payload, cancel.clone());

        let started = std::time::Instant::now();
        let handle = tokio::spawn(async move { runner.run(ctx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
