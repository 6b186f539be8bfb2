//! Training and inference loops over a shared device.
//!
//! [GraphRunner::train] and [GraphRunner::infer] are meant to run as two tasks
//! on one runtime. Both go through the same [Device], report progress as
//! [Event]s on an unbounded channel and stop when the shutdown signal flips.

mod device;
mod infer;
mod train;

use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};

use serde::Serialize;
use tokio::sync::{mpsc::UnboundedSender, watch};
use tracing::trace;

use crate::{
  data::InputProvider,
  error::Result,
  graph::{Feed, GraphTensor},
  tensor::Tensor,
};

pub use device::{Device, ExecutionMode};
pub use train::{CostWindow, TrainingOptions};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceExample {
  pub input: Tensor,
  pub output: Tensor,
}

/// Progress notifications, in the order the loops produce them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
  /// Running total after a completed step.
  BatchesTrained(u64),
  /// Mean cost over the window that closed at `batch`.
  AverageCost { batch: u64, cost: f32 },
  ExamplesPerSec(f32),
  /// Seconds since training started.
  TotalTime(f32),
  /// Inputs and reconstructions, still in normalized space.
  InferenceExamples(Vec<InferenceExample>),
}

/// Binds a placeholder to the provider that fills it.
pub struct FeedEntry {
  pub tensor: GraphTensor,
  pub provider: Box<dyn InputProvider>,
}

impl FeedEntry {
  pub fn new(tensor: GraphTensor, provider: impl InputProvider + 'static) -> Self {
    Self {
      tensor,
      provider: Box::new(provider),
    }
  }
}

/// Draws `size` examples from every entry and stacks them into batch feeds.
fn draw_feeds(entries: &mut [FeedEntry], size: usize) -> Result<Vec<Feed>> {
  entries
    .iter_mut()
    .map(|entry| {
      let examples = entry.provider.next_batch(size)?;
      Ok(Feed::new(entry.tensor, Tensor::stack(&examples)?))
    })
    .collect()
}

/// Whether the loops should wind down: shutdown requested or its sender gone.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
  *shutdown.borrow() || shutdown.has_changed().is_err()
}

#[derive(Clone)]
pub struct GraphRunner {
  device: Device,
  events: UnboundedSender<Event>,
  total_batches_trained: Arc<AtomicU64>,
}

impl GraphRunner {
  pub fn new(device: Device, events: UnboundedSender<Event>) -> Self {
    Self {
      device,
      events,
      total_batches_trained: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn device(&self) -> &Device {
    &self.device
  }

  /// Batches trained so far, across every `train` call on this runner and its clones.
  pub fn total_batches_trained(&self) -> u64 {
    self.total_batches_trained.load(Ordering::SeqCst)
  }

  fn emit(&self, event: Event) {
    if self.events.send(event).is_err() {
      trace!("event receiver dropped");
    }
  }
}
