use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace};

use crate::{config::RunConfig, error::Result, runner::Event};

use super::pipeline::{shutdown_on_ctrl_c, supervise, Pipeline};

/// Headless training: no inference, progress goes to the log.
pub struct Train {
  config: RunConfig,
}

async fn log_events(mut events: UnboundedReceiver<Event>) {
  while let Some(event) = events.recv().await {
    match event {
      Event::AverageCost { batch, cost } => info!(batch, cost, "average cost"),
      Event::ExamplesPerSec(rate) => debug!(examples_per_sec = rate, "throughput"),
      Event::TotalTime(seconds) => debug!(seconds, "elapsed"),
      Event::BatchesTrained(total) => trace!(total, "batch trained"),
      Event::InferenceExamples(_) => {}
    }
  }
}

impl Train {
  pub fn new(config: RunConfig) -> Self {
    Self { config }
  }

  /// Returns the number of batches trained.
  #[tracing::instrument(skip_all, fields(max_batches = ?self.config.max_batches))]
  pub async fn run(self) -> Result<u64> {
    let Pipeline {
      runner,
      events,
      training,
      ..
    } = Pipeline::prepare(&self.config).await?;
    let (shutdown, shutdown_rx) = shutdown_on_ctrl_c();

    let logger = tokio::spawn(log_events(events));
    let handle = training.spawn(&runner, shutdown_rx);
    drop(runner);

    let trained = supervise("training", handle, &shutdown).await?;
    let _ = logger.await;
    info!(trained, "training finished");
    Ok(trained)
  }
}
