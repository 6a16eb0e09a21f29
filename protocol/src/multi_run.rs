//! Fan-out request and consolidated result.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::run::RunHandle;

pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const DEFAULT_SYNTHESIS_TEMPERATURE: f64 = 0.2;

/// One user invocation fanned out to `concurrency` candidate runs.
///
/// Built once and never mutated afterwards: the `with_*` helpers consume
/// `self` and are meant for construction only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiRunRequest {
    pub prompt: String,
    pub concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub temperature: f64,
    pub synthesis_temperature: f64,
    /// Replaces the instruction text of the synthesis prompt. Candidates are
    /// always appended after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<i64>,
    pub timeout_seconds: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MultiRunRequest {
    pub fn new(prompt: impl Into<String>, concurrency: usize, timeout_seconds: f64) -> Self {
        Self {
            prompt: prompt.into(),
            concurrency,
            model: None,
            temperature: DEFAULT_TEMPERATURE,
            synthesis_temperature: DEFAULT_SYNTHESIS_TEMPERATURE,
            synthesis_prompt: None,
            repo_id: None,
            timeout_seconds,
            metadata: Map::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_synthesis_temperature(mut self, temperature: f64) -> Self {
        self.synthesis_temperature = temperature;
        self
    }

    pub fn with_synthesis_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.synthesis_prompt = Some(prompt.into());
        self
    }

    pub fn with_repo_id(mut self, repo_id: i64) -> Self {
        self.repo_id = Some(repo_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Outcome of a fan-out batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiRunResult {
    /// Output of the synthesis run.
    #[serde(rename = "final")]
    pub final_output: String,
    /// Candidate outputs in the order their runs were observed completing.
    pub candidates: Vec<String>,
    /// Every spawned run in spawn order, failed ones and the synthesis run
    /// (last) included.
    pub agent_runs: Vec<RunHandle>,
}
