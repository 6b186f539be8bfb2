use std::{sync::Arc, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
  sync::{
    mpsc::{self, UnboundedReceiver},
    watch,
  },
  task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
  config::RunConfig,
  data::{fetch_config, load_and_cache, Dataset, Normalization, ShuffledInputProviderBuilder},
  error::{Error, Result},
  graph::{GraphTensor, Optimizer, Session},
  model::build_autoencoder,
  runner::{Device, Event, FeedEntry, GraphRunner, TrainingOptions},
};

/// Channel holding the images. Any further channels (labels) are ignored.
pub const IMAGE_CHANNEL: usize = 0;

pub struct TrainingJob {
  cost: GraphTensor,
  feeds: Vec<FeedEntry>,
  options: TrainingOptions,
  optimizer: Box<dyn Optimizer>,
}

impl TrainingJob {
  pub fn spawn(self, runner: &GraphRunner, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<u64>> {
    let runner = runner.clone();
    tokio::spawn(async move {
      runner
        .train(self.cost, self.feeds, self.options, self.optimizer, shutdown)
        .await
    })
  }
}

pub struct InferenceJob {
  output: GraphTensor,
  feeds: Vec<FeedEntry>,
  interval: Duration,
  example_count: usize,
}

impl InferenceJob {
  pub fn spawn(self, runner: &GraphRunner, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<u64>> {
    let runner = runner.clone();
    tokio::spawn(async move {
      runner
        .infer(self.output, self.feeds, self.interval, self.example_count, shutdown)
        .await
    })
  }
}

/// A loaded dataset wired to a freshly initialized autoencoder, ready to run.
pub struct Pipeline {
  pub runner: GraphRunner,
  pub events: UnboundedReceiver<Event>,
  /// Image normalization, for mapping inference tensors back to pixels.
  pub normalization: Option<Normalization>,
  pub input_len: usize,
  pub training: TrainingJob,
  pub inference: InferenceJob,
}

impl Pipeline {
  /// Fetches the configured dataset and prepares everything around it.
  #[tracing::instrument(skip_all, fields(dataset = %config.dataset_name))]
  pub async fn prepare(config: &RunConfig) -> Result<Self> {
    let configs = fetch_config(&config.dataset_config).await?;
    let dataset_config = configs.get(&config.dataset_name).ok_or_else(|| {
      Error::dataset_load(
        &config.dataset_config,
        format!("no dataset named '{}'", config.dataset_name),
      )
    })?;
    let dataset = load_and_cache(dataset_config, &config.dataset_config).await?;
    Self::from_dataset(dataset, config)
  }

  /// Normalizes images into `[0, 1]`, flattens them, splits train/inference
  /// partitions and builds the model, session and runner.
  pub fn from_dataset(mut dataset: Dataset, config: &RunConfig) -> Result<Self> {
    dataset.normalize_within_bounds(IMAGE_CHANNEL, 0.0, 1.0)?;
    let input_len = dataset
      .examples(IMAGE_CHANNEL)?
      .first()
      .map(|t| t.len())
      .ok_or_else(|| Error::Dataset("dataset has no examples".into()))?;
    dataset.reshape_channel(IMAGE_CHANNEL, &[input_len])?;
    let normalization = dataset.normalization(IMAGE_CHANNEL)?.cloned();

    let (train, infer) = dataset.split(config.train_infer_ratio)?;
    info!(
      train = train[IMAGE_CHANNEL].len(),
      infer = infer[IMAGE_CHANNEL].len(),
      "split dataset"
    );

    let mut rng = match config.seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_entropy(),
    };
    let autoencoder = build_autoencoder(input_len, &mut rng)?;
    let input = autoencoder.input;
    let mut image_feed = |columns| -> Result<Vec<FeedEntry>> {
      let builder = ShuffledInputProviderBuilder::new(columns, StdRng::seed_from_u64(rng.gen()))?;
      let provider = builder.providers()?.swap_remove(IMAGE_CHANNEL);
      Ok(vec![FeedEntry::new(input, provider)])
    };
    let train_feeds = image_feed(train)?;
    let infer_feeds = image_feed(infer)?;

    let session = Session::new(Arc::new(autoencoder.graph))?;
    let (tx, events) = mpsc::unbounded_channel();
    let runner = GraphRunner::new(Device::new(session, config.execution), tx);

    Ok(Self {
      runner,
      events,
      normalization,
      input_len,
      training: TrainingJob {
        cost: autoencoder.cost,
        feeds: train_feeds,
        options: TrainingOptions::from(config),
        optimizer: config.optimizer.build(),
      },
      inference: InferenceJob {
        output: autoencoder.output,
        feeds: infer_feeds,
        interval: config.inference_interval(),
        example_count: config.inference_example_count,
      },
    })
  }
}

/// Awaits a loop task. A failure is logged and flips `shutdown` so the other
/// tasks wind down.
pub async fn supervise<T>(name: &str, handle: JoinHandle<Result<T>>, shutdown: &watch::Sender<bool>) -> Result<T> {
  let result = match handle.await {
    Ok(result) => result,
    Err(e) => Err(Error::Device(format!("{name} task failed: {e}"))),
  };
  if let Err(e) = &result {
    error!(task = name, error = %e, "stopping after failure");
    let _ = shutdown.send(true);
  }
  result
}

/// Shutdown signal flipped by Ctrl-C. The sender is shared so loop supervisors
/// can flip it too.
pub fn shutdown_on_ctrl_c() -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
  let (tx, rx) = watch::channel(false);
  let tx = Arc::new(tx);
  let signal_tx = Arc::clone(&tx);
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => {
        info!("ctrl-c received, shutting down");
        let _ = signal_tx.send(true);
      }
      Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
    }
  });
  (tx, rx)
}
