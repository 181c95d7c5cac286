//! Response assembly from raw store records.

use chrono::Utc;
use serde_json::{json, Map, Value};

use promptforge_core::models::progress::TQDM_REMAINING_KEY;
use promptforge_core::models::{format_hms, JobType};
use promptforge_core::repository::{JobRecord, LogEntryRecord, ProgressEventRecord};

/// Elapsed seconds: completion-to-creation once finished, otherwise time
/// since the run started. Jobs that never started have no elapsed time.
pub fn elapsed_seconds(record: &JobRecord) -> Option<f64> {
    if let Some(completed_at) = record.completed_at {
        return Some(
            (completed_at - record.created_at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0,
        );
    }
    record
        .started_at
        .map(|started_at| ((Utc::now() - started_at).num_milliseconds().max(0) as f64) / 1000.0)
}

/// `tqdm_remaining` rendered as HH:MM:SS, for non-terminal jobs only.
/// Terminal jobs return None even when the key is still present in
/// `latest_metrics`.
pub fn estimated_remaining(record: &JobRecord) -> Option<String> {
    if record.status.is_terminal() {
        return None;
    }
    record
        .latest_metrics
        .get(TQDM_REMAINING_KEY)
        .and_then(Value::as_f64)
        .map(format_hms)
}

fn overview_field(record: &JobRecord, key: &str) -> Value {
    record
        .payload_overview
        .get(key)
        .cloned()
        .unwrap_or(Value::Null)
}

fn result_metric(record: &JobRecord, key: &str) -> Value {
    record
        .result
        .as_ref()
        .and_then(|result| result.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

fn base_json(record: &JobRecord) -> Map<String, Value> {
    let mut base = Map::new();
    base.insert("job_id".to_string(), json!(record.job_id));
    base.insert("job_type".to_string(), json!(record.job_type));
    base.insert("status".to_string(), json!(record.status));
    base.insert("message".to_string(), json!(record.message));
    base.insert("created_at".to_string(), json!(record.created_at));
    base.insert("started_at".to_string(), json!(record.started_at));
    base.insert("completed_at".to_string(), json!(record.completed_at));
    base.insert("elapsed".to_string(), json!(elapsed_seconds(record)));
    base.insert(
        "estimated_remaining".to_string(),
        json!(estimated_remaining(record)),
    );
    base.insert("username".to_string(), json!(record.username));
    base.insert(
        "module_name".to_string(),
        overview_field(record, "module_name"),
    );
    base.insert(
        "optimizer_name".to_string(),
        overview_field(record, "optimizer_name"),
    );
    base.insert("model_name".to_string(), overview_field(record, "model_name"));
    base.insert(
        "dataset_rows".to_string(),
        overview_field(record, "dataset_rows"),
    );
    base.insert(
        "split_fractions".to_string(),
        overview_field(record, "split_fractions"),
    );
    base.insert("shuffle".to_string(), overview_field(record, "shuffle"));
    base.insert("seed".to_string(), overview_field(record, "seed"));
    base.insert(
        "optimizer_kwargs".to_string(),
        record
            .payload_overview
            .get("optimizer_kwargs")
            .cloned()
            .unwrap_or_else(|| json!({})),
    );
    base.insert(
        "compile_kwargs".to_string(),
        record
            .payload_overview
            .get("compile_kwargs")
            .cloned()
            .unwrap_or_else(|| json!({})),
    );
    base.insert(
        "latest_metrics".to_string(),
        Value::Object(record.latest_metrics.clone()),
    );
    base
}

/// Lightweight listing/summary view with counts instead of full arrays.
pub fn summary_json(record: &JobRecord) -> Value {
    let mut summary = base_json(record);
    summary.insert("progress_count".to_string(), json!(record.progress_count));
    summary.insert("log_count".to_string(), json!(record.log_count));
    summary.insert(
        "baseline_test_metric".to_string(),
        result_metric(record, "baseline_test_metric"),
    );
    summary.insert(
        "optimized_test_metric".to_string(),
        result_metric(record, "optimized_test_metric"),
    );
    Value::Object(summary)
}

/// Full detail view with progress events, logs, and the result once
/// terminal. Run jobs expose `result` on success; grid jobs expose
/// `grid_result` once terminal (failed grid runs keep their pair table).
pub fn detail_json(
    record: &JobRecord,
    events: &[ProgressEventRecord],
    logs: &[LogEntryRecord],
) -> Value {
    let mut detail = base_json(record);
    detail.insert(
        "progress_events".to_string(),
        Value::Array(events.iter().map(progress_json).collect()),
    );
    detail.insert(
        "logs".to_string(),
        Value::Array(logs.iter().map(log_json).collect()),
    );
    match record.job_type {
        JobType::Run => {
            let result = if record.status == promptforge_core::JobStatus::Success {
                record.result.clone().unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            detail.insert("result".to_string(), result);
        }
        JobType::GridSearch => {
            let result = if record.status.is_terminal() {
                record.result.clone().unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            detail.insert("grid_result".to_string(), result);
        }
    }
    Value::Object(detail)
}

pub fn progress_json(event: &ProgressEventRecord) -> Value {
    json!({
        "timestamp": event.timestamp,
        "event": event.event,
        "metrics": event.metrics,
    })
}

pub fn log_json(entry: &LogEntryRecord) -> Value {
    json!({
        "timestamp": entry.timestamp,
        "level": entry.level,
        "logger": entry.logger,
        "message": entry.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use promptforge_core::JobStatus;

    fn record() -> JobRecord {
        let created = Utc::now() - Duration::seconds(90);
        JobRecord {
            job_id: "job-1".to_string(),
            status: JobStatus::Running,
            job_type: JobType::Run,
            username: Some("alice".to_string()),
            created_at: created,
            started_at: Some(created + Duration::seconds(5)),
            completed_at: None,
            message: Some("Running optimization".to_string()),
            latest_metrics: json!({"tqdm_remaining": 125.0})
                .as_object()
                .unwrap()
                .clone(),
            result: None,
            payload_overview: json!({"module_name": "predict", "dataset_rows": 10})
                .as_object()
                .unwrap()
                .clone(),
            payload: None,
            progress_count: 3,
            log_count: 7,
        }
    }

    #[test]
    fn test_estimated_remaining_formats_for_active_jobs() {
        let record = record();
        assert_eq!(estimated_remaining(&record).as_deref(), Some("00:02:05"));
    }

    #[test]
    fn test_estimated_remaining_is_null_for_terminal_jobs() {
        let mut record = record();
        record.status = JobStatus::Success;
        record.completed_at = Some(Utc::now());
        // tqdm_remaining still present in latest_metrics, but the job is done.
        assert_eq!(estimated_remaining(&record), None);
    }

    #[test]
    fn test_elapsed_uses_completion_when_terminal() {
        let mut record = record();
        record.status = JobStatus::Success;
        record.completed_at = Some(record.created_at + Duration::seconds(42));
        let elapsed = elapsed_seconds(&record).unwrap();
        assert!((elapsed - 42.0).abs() < 0.5);
    }

    #[test]
    fn test_summary_includes_counts_and_overview() {
        let summary = summary_json(&record());
        assert_eq!(summary["progress_count"], json!(3));
        assert_eq!(summary["log_count"], json!(7));
        assert_eq!(summary["module_name"], json!("predict"));
        assert_eq!(summary["dataset_rows"], json!(10));
        assert_eq!(summary["username"], json!("alice"));
    }

    #[test]
    fn test_detail_hides_result_until_success() {
        let detail = detail_json(&record(), &[], &[]);
        assert_eq!(detail["result"], Value::Null);
        assert!(detail.get("grid_result").is_none());
    }
}
