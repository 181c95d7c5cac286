//! Submission payloads for the two job types.
//!
//! Field names follow the public wire format; internal names that differ
//! (`model_settings` vs the wire's `model_config`) are mapped with serde
//! renames so a stored payload can be returned to the client verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::{Validate, ValidationError};

fn default_true() -> bool {
    true
}

/// Describe how dataset columns map onto the module's signature fields.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_column_mapping", skip_on_field_errors = false))]
pub struct ColumnMapping {
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

fn validate_column_mapping(mapping: &ColumnMapping) -> Result<(), ValidationError> {
    if mapping.inputs.is_empty() {
        let mut err = ValidationError::new("missing_inputs");
        err.message = Some("At least one input column must be specified.".into());
        return Err(err);
    }
    let shared: Vec<&String> = mapping
        .inputs
        .values()
        .filter(|col| mapping.outputs.values().any(|out| out == *col))
        .collect();
    if !shared.is_empty() {
        let mut names: Vec<String> = shared.iter().map(|s| s.to_string()).collect();
        names.sort();
        names.dedup();
        let mut err = ValidationError::new("column_overlap");
        err.message = Some(
            format!(
                "Input and output column mappings must not reuse the same columns: {}",
                names.join(", ")
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

fn default_temperature() -> f64 {
    0.1
}

/// Configuration block for a language-model selection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ModelSettings {
    #[validate(length(min = 1, message = "Model name must not be empty."))]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_temperature")]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: Option<f64>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ModelSettings {
    /// Provider-agnostic identifier with any wrapping slashes stripped.
    pub fn normalized_identifier(&self) -> String {
        self.name.trim_matches('/').to_string()
    }
}

fn default_train() -> f64 {
    0.7
}

fn default_val() -> f64 {
    0.15
}

fn default_test() -> f64 {
    0.15
}

const SPLIT_SUM_TOLERANCE: f64 = 1e-6;

/// How the dataset divides into train/val/test.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_split_fractions", skip_on_field_errors = false))]
pub struct SplitFractions {
    #[serde(default = "default_train")]
    pub train: f64,

    #[serde(default = "default_val")]
    pub val: f64,

    #[serde(default = "default_test")]
    pub test: f64,
}

impl Default for SplitFractions {
    fn default() -> Self {
        Self {
            train: default_train(),
            val: default_val(),
            test: default_test(),
        }
    }
}

fn validate_split_fractions(fractions: &SplitFractions) -> Result<(), ValidationError> {
    let parts = [fractions.train, fractions.val, fractions.test];
    if parts.iter().any(|p| *p < 0.0) {
        let mut err = ValidationError::new("negative_fraction");
        err.message = Some("Split fractions must be non-negative.".into());
        return Err(err);
    }
    let total: f64 = parts.iter().sum();
    if (total - 1.0).abs() > SPLIT_SUM_TOLERANCE {
        let mut err = ValidationError::new("fraction_sum");
        err.message = Some("Split fractions must sum to 1.0.".into());
        return Err(err);
    }
    Ok(())
}

/// Primary payload for the /run endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RunRequest {
    #[validate(length(min = 1, message = "Username must not be empty."))]
    pub username: String,

    #[validate(length(min = 1, message = "Module name must not be empty."))]
    pub module_name: String,

    #[serde(default)]
    pub module_kwargs: Map<String, Value>,

    pub signature_code: String,

    pub metric_code: String,

    #[validate(length(min = 1, message = "Optimizer name must not be empty."))]
    pub optimizer_name: String,

    #[serde(default)]
    pub optimizer_kwargs: Map<String, Value>,

    #[serde(default)]
    pub compile_kwargs: Map<String, Value>,

    #[validate(length(min = 1, message = "Dataset must contain at least one row."))]
    pub dataset: Vec<Map<String, Value>>,

    #[validate]
    pub column_mapping: ColumnMapping,

    #[serde(default)]
    #[validate]
    pub split_fractions: SplitFractions,

    #[serde(default = "default_true")]
    pub shuffle: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    #[serde(rename = "model_config")]
    #[validate]
    pub model_settings: ModelSettings,

    #[serde(
        rename = "reflection_model_config",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[validate]
    pub reflection_model_settings: Option<ModelSettings>,

    #[serde(
        rename = "prompt_model_config",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[validate]
    pub prompt_model_settings: Option<ModelSettings>,

    #[serde(
        rename = "task_model_config",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[validate]
    pub task_model_settings: Option<ModelSettings>,
}

/// Payload for the /grid-search endpoint.
///
/// Same shape as [`RunRequest`] minus the per-role model blocks; the sweep is
/// the Cartesian product of `generation_models` and `reflection_models`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_grid_models", skip_on_field_errors = false))]
pub struct GridSearchRequest {
    #[validate(length(min = 1, message = "Username must not be empty."))]
    pub username: String,

    #[validate(length(min = 1, message = "Module name must not be empty."))]
    pub module_name: String,

    #[serde(default)]
    pub module_kwargs: Map<String, Value>,

    pub signature_code: String,

    pub metric_code: String,

    #[validate(length(min = 1, message = "Optimizer name must not be empty."))]
    pub optimizer_name: String,

    #[serde(default)]
    pub optimizer_kwargs: Map<String, Value>,

    #[serde(default)]
    pub compile_kwargs: Map<String, Value>,

    #[validate(length(min = 1, message = "Dataset must contain at least one row."))]
    pub dataset: Vec<Map<String, Value>>,

    #[validate]
    pub column_mapping: ColumnMapping,

    #[serde(default)]
    #[validate]
    pub split_fractions: SplitFractions,

    #[serde(default = "default_true")]
    pub shuffle: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    #[validate]
    pub generation_models: Vec<ModelSettings>,

    #[validate]
    pub reflection_models: Vec<ModelSettings>,
}

fn validate_grid_models(request: &GridSearchRequest) -> Result<(), ValidationError> {
    if request.generation_models.is_empty() {
        let mut err = ValidationError::new("missing_generation_models");
        err.message = Some("At least one generation model is required.".into());
        return Err(err);
    }
    if request.reflection_models.is_empty() {
        let mut err = ValidationError::new("missing_reflection_models");
        err.message = Some("At least one reflection model is required.".into());
        return Err(err);
    }
    Ok(())
}

impl GridSearchRequest {
    /// Total number of (generation, reflection) pairs in the sweep.
    pub fn total_pairs(&self) -> usize {
        self.generation_models.len() * self.reflection_models.len()
    }
}
