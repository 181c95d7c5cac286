//! Progress-bar metric keys and the typed view decoded from them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Metric keys captured from executor progress bars.
pub const TQDM_TOTAL_KEY: &str = "tqdm_total";
pub const TQDM_N_KEY: &str = "tqdm_n";
pub const TQDM_ELAPSED_KEY: &str = "tqdm_elapsed";
pub const TQDM_RATE_KEY: &str = "tqdm_rate";
pub const TQDM_REMAINING_KEY: &str = "tqdm_remaining";
pub const TQDM_PERCENT_KEY: &str = "tqdm_percent";
pub const TQDM_DESC_KEY: &str = "tqdm_desc";

// Progress event identifiers emitted during optimization.
pub const PROGRESS_SPLITS_READY: &str = "dataset_splits_ready";
pub const PROGRESS_BASELINE: &str = "baseline_evaluated";
pub const PROGRESS_OPTIMIZED: &str = "optimized_evaluated";
pub const PROGRESS_OPTIMIZER: &str = "optimizer_progress";

// Per-pair lifecycle events emitted during a grid search.
pub const PROGRESS_GRID_PAIR_STARTED: &str = "grid_pair_started";
pub const PROGRESS_GRID_PAIR_COMPLETED: &str = "grid_pair_completed";
pub const PROGRESS_GRID_PAIR_FAILED: &str = "grid_pair_failed";

/// Typed view over the well-known progress-bar fields of a metrics map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: Option<f64>,
    pub current: Option<f64>,
    pub elapsed: Option<f64>,
    pub rate: Option<f64>,
    pub remaining: Option<f64>,
    pub percent: Option<f64>,
    pub description: Option<String>,
}

impl ProgressSnapshot {
    /// Decode the snapshot from a metrics map; unknown keys are ignored.
    pub fn from_metrics(metrics: &Map<String, Value>) -> Self {
        Self {
            total: number(metrics, TQDM_TOTAL_KEY),
            current: number(metrics, TQDM_N_KEY),
            elapsed: number(metrics, TQDM_ELAPSED_KEY),
            rate: number(metrics, TQDM_RATE_KEY),
            remaining: number(metrics, TQDM_REMAINING_KEY),
            percent: number(metrics, TQDM_PERCENT_KEY),
            description: metrics
                .get(TQDM_DESC_KEY)
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

fn number(metrics: &Map<String, Value>, key: &str) -> Option<f64> {
    metrics.get(key).and_then(Value::as_f64)
}

/// Render a duration in seconds as `HH:MM:SS`.
pub fn format_hms(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    format!("{hours:02}:{minutes:02}:{secs:02}")
}
