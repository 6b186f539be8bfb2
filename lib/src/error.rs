use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the orchestration layer can surface to its caller.
///
/// Loop-level variants (`TrainingStep`, `InferenceStep`) wrap the engine error
/// that stopped them; nothing below the caller retries.
#[derive(Debug, Error)]
pub enum Error {
  #[error("failed to load dataset from {location}: {message}")]
  DatasetLoad { location: String, message: String },

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("malformed json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("invalid dataset operation: {0}")]
  Dataset(String),

  #[error("tensor engine error: {0}")]
  Engine(#[from] candle_core::Error),

  #[error("invalid graph construction: {0}")]
  GraphConstruction(String),

  #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
  ShapeMismatch {
    op: &'static str,
    left: Vec<usize>,
    right: Vec<usize>,
  },

  #[error("expected {expected} values, got {got}")]
  DataLength { expected: usize, got: usize },

  #[error("no feed provided for placeholder '{0}'")]
  MissingFeed(String),

  #[error("tensor handle does not belong to this graph")]
  UnknownTensor,

  #[error("training step for batch {batch} failed: {source}")]
  TrainingStep {
    batch: u64,
    #[source]
    source: Box<Error>,
  },

  #[error("inference pass failed: {source}")]
  InferenceStep {
    #[source]
    source: Box<Error>,
  },

  #[error("device failure: {0}")]
  Device(String),

  #[error("server failure: {0}")]
  Server(String),
}

impl Error {
  pub fn dataset_load(location: impl Into<String>, message: impl ToString) -> Self {
    Error::DatasetLoad {
      location: location.into(),
      message: message.to_string(),
    }
  }

  pub fn training_step(batch: u64, source: Error) -> Self {
    Error::TrainingStep {
      batch,
      source: Box::new(source),
    }
  }

  pub fn inference_step(source: Error) -> Self {
    Error::InferenceStep {
      source: Box::new(source),
    }
  }
}
