//! Deterministic demo executor.
//!
//! Performs a fake optimization: splits the dataset, emits the standard
//! progress events with progress-bar metrics, and fabricates a result whose
//! numbers are a pure function of the payload. Useful for local development
//! and for exercising the full job pipeline without a model backend.
//!
//! `module_kwargs` knobs: `sleep_seconds` (float) stretches the run,
//! `fail_with` (string) makes it fail with that message. A grid pair fails
//! when its generation model carries `extra: {"fail": true}`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::bail;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::executor::{Executor, ProgressSink};
use crate::models::progress::{
    PROGRESS_BASELINE, PROGRESS_GRID_PAIR_COMPLETED, PROGRESS_GRID_PAIR_FAILED,
    PROGRESS_GRID_PAIR_STARTED, PROGRESS_OPTIMIZED, PROGRESS_OPTIMIZER, PROGRESS_SPLITS_READY,
    TQDM_DESC_KEY, TQDM_ELAPSED_KEY, TQDM_N_KEY, TQDM_PERCENT_KEY, TQDM_RATE_KEY,
    TQDM_REMAINING_KEY, TQDM_TOTAL_KEY,
};
use crate::models::{
    GridSearchRequest, GridSearchResponse, ModelSettings, OptimizedPredictor, PairResult,
    ProgramArtifact, RunRequest, RunResponse, SplitCounts, SplitFractions,
};

const MODULES: &[&str] = &["predict", "chain_of_thought"];
const OPTIMIZERS: &[&str] = &["bootstrap_few_shot", "random_search", "gepa"];

const SLEEP_CHUNK: Duration = Duration::from_millis(50);
const DEFAULT_ROUNDS: u64 = 5;

pub struct DemoExecutor;

impl DemoExecutor {
    pub fn new() -> Self {
        DemoExecutor
    }
}

impl Default for DemoExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// First `def <name>(`-style definition in the metric code, if any.
fn metric_name_from_code(metric_code: &str) -> Option<String> {
    for line in metric_code.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("def ") {
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

fn split_counts(rows: usize, fractions: &SplitFractions) -> SplitCounts {
    let total = rows as f64;
    let train = (total * fractions.train).round() as i64;
    let val = (total * fractions.val).round() as i64;
    let train = train.min(rows as i64);
    let val = val.min(rows as i64 - train);
    SplitCounts {
        train,
        val,
        test: rows as i64 - train - val,
    }
}

/// Stable pseudo-score in [0, 1) derived from a label and seed.
fn pseudo_score(label: &str, seed: i64) -> f64 {
    let mut acc: u64 = seed as u64 ^ 0x9e37_79b9_7f4a_7c15;
    for byte in label.bytes() {
        acc = acc.wrapping_mul(31).wrapping_add(byte as u64);
    }
    (acc % 1000) as f64 / 1000.0
}

/// Identification fields shared by every per-pair grid event.
fn pair_metrics(
    pair_index: usize,
    total_pairs: usize,
    generation_model: &str,
    reflection_model: &str,
) -> Map<String, Value> {
    let mut metrics = Map::new();
    metrics.insert("pair_index".to_string(), json!(pair_index));
    metrics.insert("total_pairs".to_string(), json!(total_pairs));
    metrics.insert("generation_model".to_string(), json!(generation_model));
    metrics.insert("reflection_model".to_string(), json!(reflection_model));
    metrics
}

fn sleep_requested(module_kwargs: &Map<String, Value>) -> Option<Duration> {
    module_kwargs
        .get("sleep_seconds")
        .and_then(Value::as_f64)
        .filter(|s| *s > 0.0)
        .map(Duration::from_secs_f64)
}

fn sleep_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::thread::sleep(SLEEP_CHUNK.min(duration - start.elapsed().min(duration)));
    }
}

impl DemoExecutor {
    fn check_assets(&self, module_name: &str, optimizer_name: &str) -> Result<()> {
        if !MODULES.contains(&module_name) {
            return Err(Error::validation(format!(
                "Unknown module '{module_name}'. Registered modules: {}",
                MODULES.join(", ")
            )));
        }
        if !OPTIMIZERS.contains(&optimizer_name) {
            return Err(Error::validation(format!(
                "Unknown optimizer '{optimizer_name}'. Registered optimizers: {}",
                OPTIMIZERS.join(", ")
            )));
        }
        Ok(())
    }

    fn optimize_once(
        &self,
        module_name: &str,
        optimizer_name: &str,
        metric_code: &str,
        module_kwargs: &Map<String, Value>,
        optimizer_kwargs: &Map<String, Value>,
        dataset_rows: usize,
        fractions: &SplitFractions,
        seed: i64,
        model: &ModelSettings,
        artifact_id: &str,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<RunResponse> {
        let started = Instant::now();
        let counts = split_counts(dataset_rows, fractions);

        let mut metrics = Map::new();
        metrics.insert("train_examples".to_string(), json!(counts.train));
        metrics.insert("val_examples".to_string(), json!(counts.val));
        metrics.insert("test_examples".to_string(), json!(counts.test));
        progress.emit(PROGRESS_SPLITS_READY, &metrics);

        if let Some(reason) = module_kwargs.get("fail_with").and_then(Value::as_str) {
            bail!("{reason}");
        }

        let identifier = model.normalized_identifier();
        let baseline = 0.30 + pseudo_score(&identifier, seed) * 0.30;
        let mut metrics = Map::new();
        metrics.insert("baseline_test_metric".to_string(), json!(baseline));
        progress.emit(PROGRESS_BASELINE, &metrics);

        let rounds = optimizer_kwargs
            .get("rounds")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_ROUNDS)
            .max(1);
        let per_round_sleep = sleep_requested(module_kwargs)
            .map(|total| total / rounds as u32)
            .unwrap_or(Duration::from_millis(5));

        for round in 1..=rounds {
            sleep_for(per_round_sleep);
            let elapsed = started.elapsed().as_secs_f64();
            let rate = round as f64 / elapsed.max(1e-6);
            let mut metrics = Map::new();
            metrics.insert(TQDM_TOTAL_KEY.to_string(), json!(rounds));
            metrics.insert(TQDM_N_KEY.to_string(), json!(round));
            metrics.insert(TQDM_ELAPSED_KEY.to_string(), json!(elapsed));
            metrics.insert(TQDM_RATE_KEY.to_string(), json!(rate));
            metrics.insert(
                TQDM_REMAINING_KEY.to_string(),
                json!((rounds - round) as f64 / rate.max(1e-6)),
            );
            metrics.insert(
                TQDM_PERCENT_KEY.to_string(),
                json!(round as f64 / rounds as f64 * 100.0),
            );
            metrics.insert(TQDM_DESC_KEY.to_string(), json!("Optimizing prompt"));
            progress.emit(PROGRESS_OPTIMIZER, &metrics);
        }

        let improvement = 0.10 + pseudo_score(optimizer_name, seed) * 0.25;
        let optimized = (baseline + improvement).min(1.0);
        let mut metrics = Map::new();
        metrics.insert("optimized_test_metric".to_string(), json!(optimized));
        progress.emit(PROGRESS_OPTIMIZED, &metrics);

        let instructions = format!(
            "Answer using the {module_name} strategy. Be concise and cite the given context."
        );
        let artifact = ProgramArtifact {
            path: None,
            program_base64: None,
            metadata: Some(json!({
                "artifact_id": artifact_id,
                "module": module_name,
                "optimizer": optimizer_name,
                "model": identifier,
            })),
            optimized_prompt: Some(OptimizedPredictor {
                predictor_name: format!("{module_name}.predictor"),
                signature_name: None,
                instructions: instructions.clone(),
                input_fields: vec![],
                output_fields: vec![],
                demos: vec![],
                formatted_prompt: instructions,
            }),
        };

        let mut details = Map::new();
        details.insert("train_examples".to_string(), json!(counts.train));
        details.insert("val_examples".to_string(), json!(counts.val));
        details.insert("test_examples".to_string(), json!(counts.test));
        details.insert("baseline_test_metric".to_string(), json!(baseline));
        details.insert("optimized_test_metric".to_string(), json!(optimized));

        let mut metadata = Map::new();
        metadata.insert("optimizer".to_string(), json!(optimizer_name));
        metadata.insert("model_identifier".to_string(), json!(identifier));
        metadata.insert("rounds".to_string(), json!(rounds));

        Ok(RunResponse {
            module_name: module_name.to_string(),
            optimizer_name: optimizer_name.to_string(),
            metric_name: metric_name_from_code(metric_code),
            split_counts: counts,
            baseline_test_metric: Some(baseline),
            optimized_test_metric: Some(optimized),
            optimization_metadata: metadata,
            details,
            program_artifact: Some(artifact),
            runtime_seconds: Some(started.elapsed().as_secs_f64()),
        })
    }
}

impl Executor for DemoExecutor {
    fn validate(&self, payload: &RunRequest) -> Result<()> {
        self.check_assets(&payload.module_name, &payload.optimizer_name)?;
        if payload.signature_code.trim().is_empty() {
            return Err(Error::validation("signature_code must not be empty."));
        }
        if payload.metric_code.trim().is_empty() {
            return Err(Error::validation("metric_code must not be empty."));
        }
        Ok(())
    }

    fn validate_grid(&self, payload: &GridSearchRequest) -> Result<()> {
        self.check_assets(&payload.module_name, &payload.optimizer_name)?;
        if payload.metric_code.trim().is_empty() {
            return Err(Error::validation("metric_code must not be empty."));
        }
        Ok(())
    }

    fn run(
        &self,
        payload: &RunRequest,
        artifact_id: &str,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<RunResponse> {
        self.optimize_once(
            &payload.module_name,
            &payload.optimizer_name,
            &payload.metric_code,
            &payload.module_kwargs,
            &payload.optimizer_kwargs,
            payload.dataset.len(),
            &payload.split_fractions,
            payload.seed.unwrap_or(0),
            &payload.model_settings,
            artifact_id,
            progress,
        )
    }

    fn run_grid(
        &self,
        payload: &GridSearchRequest,
        artifact_id: &str,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<GridSearchResponse> {
        let started = Instant::now();
        let counts = split_counts(payload.dataset.len(), &payload.split_fractions);
        let total_pairs = payload.total_pairs();

        let mut metrics = Map::new();
        metrics.insert("train_examples".to_string(), json!(counts.train));
        metrics.insert("val_examples".to_string(), json!(counts.val));
        metrics.insert("test_examples".to_string(), json!(counts.test));
        metrics.insert("total_pairs".to_string(), json!(total_pairs));
        progress.emit(PROGRESS_SPLITS_READY, &metrics);

        let mut pair_results: Vec<PairResult> = Vec::with_capacity(total_pairs);
        let mut pair_index = 0usize;
        for generation in &payload.generation_models {
            for reflection in &payload.reflection_models {
                let generation_model = generation.normalized_identifier();
                let reflection_model = reflection.normalized_identifier();

                let mut metrics = pair_metrics(
                    pair_index,
                    total_pairs,
                    &generation_model,
                    &reflection_model,
                );
                progress.emit(PROGRESS_GRID_PAIR_STARTED, &metrics);

                let forced_failure = generation
                    .extra
                    .get("fail")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let pair_started = Instant::now();
                let pair = if forced_failure {
                    PairResult {
                        pair_index,
                        generation_model: generation_model.clone(),
                        reflection_model: reflection_model.clone(),
                        baseline_test_metric: None,
                        optimized_test_metric: None,
                        metric_improvement: None,
                        runtime_seconds: None,
                        error: Some(format!("Model '{generation_model}' is unavailable")),
                    }
                } else {
                    match self.optimize_once(
                        &payload.module_name,
                        &payload.optimizer_name,
                        &payload.metric_code,
                        &payload.module_kwargs,
                        &payload.optimizer_kwargs,
                        payload.dataset.len(),
                        &payload.split_fractions,
                        payload.seed.unwrap_or(0) + pair_index as i64,
                        generation,
                        artifact_id,
                        progress,
                    ) {
                        Ok(result) => PairResult {
                            pair_index,
                            generation_model: generation_model.clone(),
                            reflection_model: reflection_model.clone(),
                            baseline_test_metric: result.baseline_test_metric,
                            optimized_test_metric: result.optimized_test_metric,
                            metric_improvement: match (
                                result.baseline_test_metric,
                                result.optimized_test_metric,
                            ) {
                                (Some(b), Some(o)) => Some(o - b),
                                _ => None,
                            },
                            runtime_seconds: Some(pair_started.elapsed().as_secs_f64()),
                            error: None,
                        },
                        Err(err) => PairResult {
                            pair_index,
                            generation_model: generation_model.clone(),
                            reflection_model: reflection_model.clone(),
                            baseline_test_metric: None,
                            optimized_test_metric: None,
                            metric_improvement: None,
                            runtime_seconds: Some(pair_started.elapsed().as_secs_f64()),
                            error: Some(err.to_string()),
                        },
                    }
                };
                pair_results.push(pair);

                // Outcome event carries the live tallies so pollers can
                // render mid-run grid state.
                let completed_so_far = pair_results.iter().filter(|p| p.succeeded()).count();
                let failed_so_far = pair_results.len() - completed_so_far;
                metrics.insert("completed_so_far".to_string(), json!(completed_so_far));
                metrics.insert("failed_so_far".to_string(), json!(failed_so_far));
                let last = pair_results.last().expect("pair was just pushed");
                match &last.error {
                    Some(error) => {
                        metrics.insert("error".to_string(), json!(error));
                        progress.emit(PROGRESS_GRID_PAIR_FAILED, &metrics);
                    }
                    None => {
                        metrics.insert(
                            "baseline_test_metric".to_string(),
                            json!(last.baseline_test_metric),
                        );
                        metrics.insert(
                            "optimized_test_metric".to_string(),
                            json!(last.optimized_test_metric),
                        );
                        metrics.insert(
                            "metric_improvement".to_string(),
                            json!(last.metric_improvement),
                        );
                        metrics.insert(
                            "runtime_seconds".to_string(),
                            json!(last.runtime_seconds),
                        );
                        progress.emit(PROGRESS_GRID_PAIR_COMPLETED, &metrics);
                    }
                }
                pair_index += 1;
            }
        }

        let completed_pairs = pair_results.iter().filter(|p| p.succeeded()).count();
        let failed_pairs = pair_results.len() - completed_pairs;
        let best_pair = pair_results
            .iter()
            .filter(|p| p.succeeded())
            .max_by(|a, b| {
                a.optimized_test_metric
                    .partial_cmp(&b.optimized_test_metric)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned();

        Ok(GridSearchResponse {
            module_name: payload.module_name.clone(),
            optimizer_name: payload.optimizer_name.clone(),
            metric_name: metric_name_from_code(&payload.metric_code),
            split_counts: counts,
            total_pairs,
            completed_pairs,
            failed_pairs,
            pair_results,
            best_pair,
            runtime_seconds: Some(started.elapsed().as_secs_f64()),
        })
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        let mut assets = BTreeMap::new();
        assets.insert(
            "modules".to_string(),
            MODULES.iter().map(|s| s.to_string()).collect(),
        );
        assets.insert(
            "optimizers".to_string(),
            OPTIMIZERS.iter().map(|s| s.to_string()).collect(),
        );
        assets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn run_payload() -> RunRequest {
        serde_json::from_value(json!({
            "username": "alice",
            "module_name": "predict",
            "signature_code": "question -> answer",
            "metric_code": "def exact_match(example, pred):\n    return 1.0\n",
            "optimizer_name": "bootstrap_few_shot",
            "dataset": [
                {"q": "a", "a": "1"},
                {"q": "b", "a": "2"},
                {"q": "c", "a": "3"},
                {"q": "d", "a": "4"}
            ],
            "column_mapping": {"inputs": {"question": "q"}, "outputs": {"answer": "a"}},
            "split_fractions": {"train": 0.5, "val": 0.25, "test": 0.25},
            "seed": 7,
            "model_config": {"name": "openai/gpt-4o-mini"}
        }))
        .unwrap()
    }

    struct Collector(Mutex<Vec<(String, Map<String, Value>)>>);

    impl Collector {
        fn new() -> Self {
            Collector(Mutex::new(Vec::new()))
        }

        fn names(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }
    }

    impl ProgressSink for Collector {
        fn emit(&self, event: &str, metrics: &Map<String, Value>) {
            self.0
                .lock()
                .unwrap()
                .push((event.to_string(), metrics.clone()));
        }
    }

    #[test]
    fn test_validate_rejects_unknown_module() {
        let executor = DemoExecutor::new();
        let mut payload = run_payload();
        payload.module_name = "nonexistent".to_string();
        let err = executor.validate(&payload).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_run_emits_events_and_result() {
        let executor = DemoExecutor::new();
        let payload = run_payload();
        let sink = Collector::new();
        let result = executor.run(&payload, "job-1", &sink).unwrap();

        assert_eq!(result.metric_name.as_deref(), Some("exact_match"));
        assert_eq!(result.split_counts.train, 2);
        assert_eq!(
            result.split_counts.train + result.split_counts.val + result.split_counts.test,
            4
        );
        assert!(result.optimized_test_metric.unwrap() >= result.baseline_test_metric.unwrap());

        let names = sink.names();
        assert_eq!(names.first().map(String::as_str), Some(PROGRESS_SPLITS_READY));
        assert!(names.iter().any(|e| e == PROGRESS_OPTIMIZER));
        assert_eq!(names.last().map(String::as_str), Some(PROGRESS_OPTIMIZED));
    }

    #[test]
    fn test_run_is_deterministic() {
        let executor = DemoExecutor::new();
        let payload = run_payload();
        let sink = Collector::new();
        let first = executor.run(&payload, "job-1", &sink).unwrap();
        let second = executor.run(&payload, "job-1", &sink).unwrap();
        assert_eq!(first.baseline_test_metric, second.baseline_test_metric);
        assert_eq!(first.optimized_test_metric, second.optimized_test_metric);
    }

    #[test]
    fn test_fail_with_knob() {
        let executor = DemoExecutor::new();
        let mut payload = run_payload();
        payload
            .module_kwargs
            .insert("fail_with".to_string(), json!("Dataset column mismatch"));
        let sink = Collector::new();
        let err = executor.run(&payload, "job-1", &sink).unwrap_err();
        assert!(err.to_string().contains("column mismatch"));
    }

    #[test]
    fn test_grid_counts_failed_pairs() {
        let executor = DemoExecutor::new();
        let payload: GridSearchRequest = serde_json::from_value(json!({
            "username": "alice",
            "module_name": "predict",
            "signature_code": "question -> answer",
            "metric_code": "def metric(example, pred):\n    return 1.0\n",
            "optimizer_name": "bootstrap_few_shot",
            "dataset": [{"q": "a", "a": "1"}],
            "column_mapping": {"inputs": {"question": "q"}, "outputs": {"answer": "a"}},
            "split_fractions": {"train": 1.0, "val": 0.0, "test": 0.0},
            "generation_models": [
                {"name": "openai/gpt-4o-mini"},
                {"name": "openai/broken", "extra": {"fail": true}}
            ],
            "reflection_models": [{"name": "openai/gpt-4o"}]
        }))
        .unwrap();

        let sink = Collector::new();
        let result = executor.run_grid(&payload, "job-1", &sink).unwrap();
        assert_eq!(result.total_pairs, 2);
        assert_eq!(result.completed_pairs, 1);
        assert_eq!(result.failed_pairs, 1);
        assert!(result.pair_results[1].error.is_some());
        let best = result.best_pair.unwrap();
        assert_eq!(best.pair_index, 0);

        // Per-pair lifecycle events, with live tallies on the outcomes.
        let events = sink.0.lock().unwrap();
        assert_eq!(events[0].0, PROGRESS_SPLITS_READY);
        assert_eq!(events[0].1.get("total_pairs"), Some(&json!(2)));
        let starts: Vec<&Map<String, Value>> = events
            .iter()
            .filter(|(name, _)| name == PROGRESS_GRID_PAIR_STARTED)
            .map(|(_, metrics)| metrics)
            .collect();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0].get("pair_index"), Some(&json!(0)));
        assert_eq!(
            starts[1].get("generation_model"),
            Some(&json!("openai/broken"))
        );

        let completed = events
            .iter()
            .find(|(name, _)| name == PROGRESS_GRID_PAIR_COMPLETED)
            .map(|(_, metrics)| metrics)
            .unwrap();
        assert!(completed.get("optimized_test_metric").unwrap().is_number());
        assert_eq!(completed.get("completed_so_far"), Some(&json!(1)));

        let failed = events
            .iter()
            .find(|(name, _)| name == PROGRESS_GRID_PAIR_FAILED)
            .map(|(_, metrics)| metrics)
            .unwrap();
        assert!(failed
            .get("error")
            .and_then(Value::as_str)
            .unwrap()
            .contains("unavailable"));
        assert_eq!(failed.get("failed_so_far"), Some(&json!(1)));
    }

    #[test]
    fn test_metric_name_extraction() {
        assert_eq!(
            metric_name_from_code("def my_metric(a, b):\n    pass"),
            Some("my_metric".to_string())
        );
        assert_eq!(metric_name_from_code("x = 1"), None);
    }
}
