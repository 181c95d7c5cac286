//! Result payloads produced by executors and stored on terminal jobs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Number of examples in each dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCounts {
    pub train: i64,
    pub val: i64,
    pub test: i64,
}

/// A single few-shot demonstration from an optimized predictor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizedDemo {
    #[serde(default)]
    pub inputs: Map<String, Value>,

    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// Extracted prompt and demos for one predictor of the compiled program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedPredictor {
    pub predictor_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_name: Option<String>,

    pub instructions: String,

    #[serde(default)]
    pub input_fields: Vec<String>,

    #[serde(default)]
    pub output_fields: Vec<String>,

    #[serde(default)]
    pub demos: Vec<OptimizedDemo>,

    /// Complete prompt as a single formatted string, instructions and demos included.
    #[serde(default)]
    pub formatted_prompt: String,
}

/// Serializable payload carrying the optimized program files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramArtifact {
    /// Path on the server where the artifact lives, when persisted to disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Base64-encoded serialized program bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_base64: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_prompt: Option<OptimizedPredictor>,
}

/// Result of a single optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub module_name: String,

    pub optimizer_name: String,

    pub metric_name: Option<String>,

    pub split_counts: SplitCounts,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_test_metric: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_test_metric: Option<f64>,

    #[serde(default)]
    pub optimization_metadata: Map<String, Value>,

    #[serde(default)]
    pub details: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_artifact: Option<ProgramArtifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<f64>,
}

/// Outcome of one (generation, reflection) pair in a grid search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairResult {
    pub pair_index: usize,

    pub generation_model: String,

    pub reflection_model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_test_metric: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_test_metric: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_improvement: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<f64>,

    /// Failure detail when this pair did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PairResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a full grid search over model pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSearchResponse {
    pub module_name: String,

    pub optimizer_name: String,

    pub metric_name: Option<String>,

    pub split_counts: SplitCounts,

    pub total_pairs: usize,

    pub completed_pairs: usize,

    pub failed_pairs: usize,

    #[serde(default)]
    pub pair_results: Vec<PairResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_pair: Option<PairResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_response_roundtrip() {
        let response = RunResponse {
            module_name: "predict".to_string(),
            optimizer_name: "bootstrap_few_shot".to_string(),
            metric_name: Some("metric".to_string()),
            split_counts: SplitCounts {
                train: 8,
                val: 1,
                test: 1,
            },
            baseline_test_metric: Some(0.4),
            optimized_test_metric: Some(0.8),
            optimization_metadata: Map::new(),
            details: Map::new(),
            program_artifact: None,
            runtime_seconds: Some(1.5),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["metric_name"], json!("metric"));
        let back: RunResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back.split_counts, response.split_counts);
    }

    #[test]
    fn test_pair_result_success_flag() {
        let ok = PairResult {
            pair_index: 0,
            generation_model: "openai/gpt-4o-mini".to_string(),
            reflection_model: "openai/gpt-4o".to_string(),
            baseline_test_metric: Some(0.5),
            optimized_test_metric: Some(0.7),
            metric_improvement: Some(0.2),
            runtime_seconds: Some(2.0),
            error: None,
        };
        assert!(ok.succeeded());

        let failed = PairResult {
            error: Some("Connection timeout".to_string()),
            ..ok
        };
        assert!(!failed.succeeded());
    }
}
