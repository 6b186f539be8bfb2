use std::{sync::atomic::Ordering, time::Duration};

use tokio::{
  sync::watch,
  time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
  config::RunConfig,
  error::{Error, Result},
  graph::{GraphTensor, Optimizer},
};

use super::{draw_feeds, stopping, Event, FeedEntry, GraphRunner};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOptions {
  pub batch_size: usize,
  /// Batch costs per reported average.
  pub cost_window: usize,
  /// Wall-clock cadence of throughput and elapsed-time reports.
  pub metrics_interval: Duration,
  /// Stop after this many steps of this run. Unbounded when `None`.
  pub max_batches: Option<u64>,
}

impl From<&RunConfig> for TrainingOptions {
  fn from(config: &RunConfig) -> Self {
    Self {
      batch_size: config.batch_size,
      cost_window: config.cost_window,
      metrics_interval: config.metrics_interval(),
      max_batches: config.max_batches,
    }
  }
}

/// Tumbling mean over consecutive batch costs.
#[derive(Debug, Clone)]
pub struct CostWindow {
  size: usize,
  sum: f32,
  count: usize,
}

impl CostWindow {
  pub fn new(size: usize) -> Self {
    Self {
      size: size.max(1),
      sum: 0.0,
      count: 0,
    }
  }

  /// Adds a cost; returns the window mean when this cost closes the window.
  pub fn push(&mut self, cost: f32) -> Option<f32> {
    self.sum += cost;
    self.count += 1;
    if self.count < self.size {
      return None;
    }
    let mean = self.sum / self.count as f32;
    self.sum = 0.0;
    self.count = 0;
    Some(mean)
  }
}

/// Examples per second between reports, and time since training started.
#[derive(Debug, Clone)]
struct Throughput {
  started: Instant,
  last_report: Instant,
  examples: u64,
}

impl Throughput {
  fn new(started: Instant) -> Self {
    Self {
      started,
      last_report: started,
      examples: 0,
    }
  }

  fn record(&mut self, examples: usize) {
    self.examples += examples as u64;
  }

  /// Returns `(examples per second, total seconds)` and starts a new period.
  fn report(&mut self, now: Instant) -> (f32, f32) {
    let since = now.saturating_duration_since(self.last_report);
    let rate = if since.is_zero() {
      0.0
    } else {
      self.examples as f32 / since.as_secs_f32()
    };
    self.last_report = now;
    self.examples = 0;
    (rate, now.saturating_duration_since(self.started).as_secs_f32())
  }
}

impl GraphRunner {
  fn report_throughput(&self, throughput: &mut Throughput) {
    let (rate, total) = throughput.report(Instant::now());
    debug!(examples_per_sec = rate, total_secs = total, "throughput");
    self.emit(Event::ExamplesPerSec(rate));
    self.emit(Event::TotalTime(total));
  }

  /// Runs optimizer steps minimizing `cost` until shutdown, until
  /// `options.max_batches` steps are done, or until a step fails.
  ///
  /// Throughput and elapsed time are reported every `options.metrics_interval`,
  /// also while a step is still running.
  ///
  /// Returns the number of steps completed by this call. A failed step ends
  /// the loop with [Error::TrainingStep] naming the batch that failed; nothing
  /// is published for it.
  #[tracing::instrument(skip_all, fields(batch_size = options.batch_size))]
  pub async fn train(
    &self,
    cost: GraphTensor,
    mut feeds: Vec<FeedEntry>,
    options: TrainingOptions,
    mut optimizer: Box<dyn Optimizer>,
    shutdown: watch::Receiver<bool>,
  ) -> Result<u64> {
    if options.batch_size == 0 {
      return Err(Error::Config("batch size must be positive".into()));
    }
    if options.metrics_interval.is_zero() {
      return Err(Error::Config("metrics interval must be positive".into()));
    }
    let started = Instant::now();
    let mut throughput = Throughput::new(started);
    let mut ticker = interval_at(started + options.metrics_interval, options.metrics_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut window = CostWindow::new(options.cost_window);
    let mut trained = 0u64;
    info!("training started");

    while !stopping(&shutdown) && options.max_batches.map_or(true, |max| trained < max) {
      let batch = self.total_batches_trained() + 1;
      let batch_feeds = draw_feeds(&mut feeds, options.batch_size).map_err(|e| Error::training_step(batch, e))?;

      let step = self.device.execute(move |session| {
        let c = session.train(cost, &batch_feeds, optimizer.as_mut())?;
        Ok((c, optimizer))
      });
      tokio::pin!(step);
      let result = loop {
        tokio::select! {
          biased;
          _ = ticker.tick() => self.report_throughput(&mut throughput),
          result = &mut step => break result,
        }
      };
      let (batch_cost, returned) = result.map_err(|e| Error::training_step(batch, e))?;
      optimizer = returned;

      let total = self.total_batches_trained.fetch_add(1, Ordering::SeqCst) + 1;
      trained += 1;
      throughput.record(options.batch_size);

      if let Some(mean) = window.push(batch_cost) {
        debug!(batch = total, cost = mean, "average cost");
        self.emit(Event::AverageCost {
          batch: total,
          cost: mean,
        });
      }
      self.emit(Event::BatchesTrained(total));

      tokio::task::yield_now().await;
    }

    info!(trained, total = self.total_batches_trained(), "training stopped");
    Ok(trained)
  }
}
