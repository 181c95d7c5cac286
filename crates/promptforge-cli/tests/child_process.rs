//! Tests for the `run-job` child-process protocol against the real binary.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use promptforge_core::repository::SqliteJobStore;
use promptforge_core::runner::{ChildCommand, ChildEvent, JobRunner, RunContext, RunOutcome, SubprocessRunner};
use promptforge_core::{JobStore, JobType};

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_promptforge"))
}

fn run_payload() -> Value {
    json!({
        "username": "alice",
        "module_name": "predict",
        "signature_code": "question -> answer",
        "metric_code": "def metric(example, pred):\n    return 1.0\n",
        "optimizer_name": "bootstrap_few_shot",
        "dataset": [{"q": "what is up", "a": "the sky"}],
        "column_mapping": {
            "inputs": {"question": "q"},
            "outputs": {"answer": "a"}
        },
        "split_fractions": {"train": 1.0, "val": 0.0, "test": 0.0},
        "model_config": {"name": "openai/gpt-4o-mini"}
    })
}

/// Launch the binary in child mode, feed it a request, and decode the
/// resulting event stream.
fn drive_child(request: Value) -> (Vec<ChildEvent>, i32) {
    let mut child = Command::new(binary_path())
        .arg("run-job")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn child");

    child
        .stdin
        .take()
        .unwrap()
        .write_all(request.to_string().as_bytes())
        .unwrap();

    let output = child.wait_with_output().expect("child did not run");
    let events: Vec<ChildEvent> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("undecodable event line"))
        .collect();
    (events, output.status.code().unwrap_or(-1))
}

#[test]
fn child_reports_progress_then_result() {
    let request = json!({
        "job_id": "job-1",
        "job_type": "run",
        "payload": run_payload(),
    });
    let (events, code) = drive_child(request);
    assert_eq!(code, 0);

    assert!(events
        .iter()
        .any(|event| matches!(event, ChildEvent::Progress { event, .. } if event == "dataset_splits_ready")));
    match events.last().expect("no events") {
        ChildEvent::Result { result } => {
            assert_eq!(result["metric_name"], json!("metric"));
            assert_eq!(result["module_name"], json!("predict"));
        }
        other => panic!("expected a trailing result event, got {other:?}"),
    }
}

#[test]
fn child_reports_error_with_traceback() {
    let mut payload = run_payload();
    payload["module_kwargs"] = json!({"fail_with": "Dataset column mismatch"});
    let request = json!({
        "job_id": "job-1",
        "job_type": "run",
        "payload": payload,
    });
    let (events, code) = drive_child(request);
    assert_eq!(code, 1);

    match events.last().expect("no events") {
        ChildEvent::Error { message, traceback } => {
            assert!(message.contains("column mismatch"));
            assert!(!traceback.is_empty());
        }
        other => panic!("expected a trailing error event, got {other:?}"),
    }
}

#[test]
fn child_rejects_garbage_request() {
    let (events, code) = drive_child(json!("not a request"));
    assert_eq!(code, 1);
    assert!(matches!(events.last(), Some(ChildEvent::Error { .. })));
}

#[tokio::test]
async fn subprocess_runner_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::connect(path.to_str().unwrap())
            .await
            .unwrap(),
    );
    store.create_job("job-1").await.unwrap();

    let runner = SubprocessRunner::new(
        ChildCommand {
            program: binary_path(),
            args: vec!["run-job".to_string()],
        },
        Duration::from_millis(50),
    );
    let ctx = RunContext {
        job_id: "job-1".to_string(),
        job_type: JobType::Run,
        payload: run_payload(),
        store: store.clone(),
        cancel: Arc::new(AtomicBool::new(false)),
        on_activity: Arc::new(|| {}),
    };

    let outcome = runner.run(ctx).await.unwrap();
    match outcome {
        RunOutcome::Completed(result) => {
            assert_eq!(result["metric_name"], json!("metric"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // The child's progress callbacks landed in the store.
    assert!(store.get_progress_count("job-1").await.unwrap() > 0);
    let record = store.get_job("job-1").await.unwrap();
    assert!(record.latest_metrics.contains_key("optimized_test_metric"));
}

#[tokio::test]
async fn subprocess_runner_cancels_slow_child() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::connect(path.to_str().unwrap())
            .await
            .unwrap(),
    );
    store.create_job("job-1").await.unwrap();

    let mut payload = run_payload();
    payload["module_kwargs"] = json!({"sleep_seconds": 30.0});

    let runner = SubprocessRunner::new(
        ChildCommand {
            program: binary_path(),
            args: vec!["run-job".to_string()],
        },
        Duration::from_millis(50),
    );
    let cancel = Arc::new(AtomicBool::new(false));
    let ctx = RunContext {
        job_id: "job-1".to_string(),
        job_type: JobType::Run,
        payload,
        store,
        cancel: cancel.clone(),
        on_activity: Arc::new(|| {}),
    };

    let started = std::time::Instant::now();
    let handle = tokio::spawn(async move { runner.run(ctx).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.store(true, std::sync::atomic::Ordering::SeqCst);

    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled));
    // Cancel-to-outcome latency stays within the poll + termination budget.
    assert!(started.elapsed() < Duration::from_secs(8));
}
