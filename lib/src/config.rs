use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{graph::OptimizerConfig, runner::ExecutionMode};

/// Settings for one training/inference session.
///
/// Every field has a default, so an empty document deserializes to the stock
/// MNIST demo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
  /// Local path or http(s) URL of the dataset config JSON.
  pub dataset_config: String,
  /// Key of the dataset inside the config document.
  pub dataset_name: String,
  /// Share of examples used for training, the rest goes to inference.
  pub train_infer_ratio: f32,
  pub batch_size: usize,
  pub optimizer: OptimizerConfig,
  /// Number of batch costs averaged into one reported cost.
  pub cost_window: usize,
  pub metrics_interval_ms: u64,
  pub inference_interval_ms: u64,
  pub inference_example_count: usize,
  /// Stop after this many batches. Unbounded when absent.
  pub max_batches: Option<u64>,
  /// Seeds weight init and shuffling. Drawn from entropy when absent.
  pub seed: Option<u64>,
  pub execution: ExecutionMode,
}

impl Default for RunConfig {
  fn default() -> Self {
    Self {
      dataset_config: "static/dataset.config.json".into(),
      dataset_name: "mnist".into(),
      train_infer_ratio: 0.9,
      batch_size: 32,
      optimizer: OptimizerConfig::default(),
      cost_window: 10,
      metrics_interval_ms: 500,
      inference_interval_ms: 10_000,
      inference_example_count: 5,
      max_batches: None,
      seed: None,
      execution: ExecutionMode::default(),
    }
  }
}

impl RunConfig {
  pub fn metrics_interval(&self) -> Duration {
    Duration::from_millis(self.metrics_interval_ms)
  }

  pub fn inference_interval(&self) -> Duration {
    Duration::from_millis(self.inference_interval_ms)
  }
}
