//! Configuration for the flowchron pipeline
//!
//! Settings come from `flowchron.toml` (see `flowchron_common::config` for
//! the file location rules); command-line flags override individual fields.
//!
//! ```toml
//! data_root = "data"
//!
//! [logging]
//! level = "info"
//!
//! [pipeline]
//! n_split = 350
//! sample_cpu_fraction = 0.25
//! failure_policy = "collect_all"
//! ```

use crate::error::Result;
use crate::planner::WorkerBudget;
use flowchron_common::config::{load_toml_config_or_default, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the dispatcher does after a chunk fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Run every chunk, report failures alongside completed results
    #[default]
    CollectAll,
    /// Stop submitting chunks after the first failure; in-flight chunks finish
    FailFast,
}

/// `[pipeline]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Exact number of training chunks (capped at the flow count); 0 trains
    /// a single model on the whole dataset
    pub n_split: usize,

    /// Concurrent training workers (default: CPU count)
    pub train_workers: Option<usize>,

    /// Sampling budget as a fraction of the CPU count, used when
    /// `sample_workers` is unset
    pub sample_cpu_fraction: f64,

    /// Concurrent sampling workers, overrides `sample_cpu_fraction`
    pub sample_workers: Option<usize>,

    pub failure_policy: FailurePolicy,

    /// Per-chunk timeout in seconds
    pub task_timeout_secs: Option<u64>,

    /// Compose a model from the surviving chunks when some training chunks fail
    pub allow_partial_model: bool,

    /// Write every trained sub-model to the chunk directory as it completes
    pub persist_chunks: bool,

    /// Name used to namespace sub-models and artifacts
    pub model_name: String,

    /// Temporal key column of the input dataset
    pub time_column: String,

    /// Columns whose value tuple identifies a baseline pattern
    pub key_columns: Vec<String>,

    /// Minimum occurrences for a baseline pattern to be kept
    pub min_support: u64,

    /// Equal-width bins used for numeric columns
    pub continuous_bins: usize,

    /// Seed for pattern and flow sampling
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            n_split: 350,
            train_workers: None,
            sample_cpu_fraction: 0.25,
            sample_workers: None,
            failure_policy: FailurePolicy::CollectAll,
            task_timeout_secs: None,
            allow_partial_model: false,
            persist_chunks: false,
            model_name: "flowchron".to_string(),
            time_column: crate::dataset::DEFAULT_TIME_COLUMN.to_string(),
            key_columns: vec!["Proto".to_string(), "Dst Pt".to_string()],
            min_support: 1,
            continuous_bins: 10,
            seed: 42,
        }
    }
}

impl PipelineConfig {
    /// Worker budget for the training stage
    pub fn train_budget(&self) -> Result<WorkerBudget> {
        match self.train_workers {
            Some(workers) => WorkerBudget::new(workers),
            None => WorkerBudget::new(num_cpus::get()),
        }
    }

    /// Worker budget for the sampling stage
    pub fn sample_budget(&self) -> Result<WorkerBudget> {
        match self.sample_workers {
            Some(workers) => WorkerBudget::new(workers),
            None => WorkerBudget::from_cpu_fraction(self.sample_cpu_fraction),
        }
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// File-name prefix for per-chunk training artifacts
    pub fn chunk_artifact_prefix(&self) -> String {
        format!("{}_split{}_", self.model_name, self.n_split)
    }
}

/// Top-level `flowchron.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub data_root: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

impl TomlConfig {
    /// Load from `path`, falling back to defaults when absent or invalid
    pub fn load(path: Option<&Path>) -> Self {
        load_toml_config_or_default(path)
    }
}
