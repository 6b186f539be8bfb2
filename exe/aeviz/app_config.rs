use std::{error::Error, path::Path};

use aeviz::{graph::OptimizerConfig, runner::ExecutionMode, RunConfig};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 4545;

/// Run settings as read from a YAML file or the command line.
/// Also defines the config file format (Option fields can be omitted).
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
  /// Dashboard port
  pub port: Option<u16>,
  /// Path or URL of the dataset config JSON
  pub dataset_config: Option<String>,
  pub dataset_name: Option<String>,
  pub train_infer_ratio: Option<f32>,
  pub batch_size: Option<usize>,
  pub optimizer: Option<OptimizerConfig>,
  pub cost_window: Option<usize>,
  pub metrics_interval_ms: Option<u64>,
  pub inference_interval_ms: Option<u64>,
  pub inference_example_count: Option<usize>,
  /// Stop training after this many batches
  pub max_batches: Option<u64>,
  pub seed: Option<u64>,
  pub execution: Option<ExecutionMode>,
}

impl AppConfig {
  pub fn from_file(path: &Path) -> Result<Self, Box<dyn Error>> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    Ok(serde_yaml::from_str(&content)?)
  }

  // merge configs where the second overwrites the first
  pub fn merge(self, other: Self) -> Self {
    Self {
      port: other.port.or(self.port),
      dataset_config: other.dataset_config.or(self.dataset_config),
      dataset_name: other.dataset_name.or(self.dataset_name),
      train_infer_ratio: other.train_infer_ratio.or(self.train_infer_ratio),
      batch_size: other.batch_size.or(self.batch_size),
      optimizer: other.optimizer.or(self.optimizer),
      cost_window: other.cost_window.or(self.cost_window),
      metrics_interval_ms: other.metrics_interval_ms.or(self.metrics_interval_ms),
      inference_interval_ms: other.inference_interval_ms.or(self.inference_interval_ms),
      inference_example_count: other.inference_example_count.or(self.inference_example_count),
      max_batches: other.max_batches.or(self.max_batches),
      seed: other.seed.or(self.seed),
      execution: other.execution.or(self.execution),
    }
  }

  pub fn port(&self) -> u16 {
    self.port.unwrap_or(DEFAULT_PORT)
  }

  /// Fills every unset field from the library defaults.
  pub fn run_config(&self) -> RunConfig {
    let d = RunConfig::default();
    let this = self.clone();
    RunConfig {
      dataset_config: this.dataset_config.unwrap_or(d.dataset_config),
      dataset_name: this.dataset_name.unwrap_or(d.dataset_name),
      train_infer_ratio: this.train_infer_ratio.unwrap_or(d.train_infer_ratio),
      batch_size: this.batch_size.unwrap_or(d.batch_size),
      optimizer: this.optimizer.unwrap_or(d.optimizer),
      cost_window: this.cost_window.unwrap_or(d.cost_window),
      metrics_interval_ms: this.metrics_interval_ms.unwrap_or(d.metrics_interval_ms),
      inference_interval_ms: this.inference_interval_ms.unwrap_or(d.inference_interval_ms),
      inference_example_count: this.inference_example_count.unwrap_or(d.inference_example_count),
      max_batches: this.max_batches.or(d.max_batches),
      seed: this.seed.or(d.seed),
      execution: this.execution.unwrap_or(d.execution),
    }
  }
}
