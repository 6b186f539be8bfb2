use std::time::Duration;

use tokio::{
  sync::watch,
  time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
  error::{Error, Result},
  graph::GraphTensor,
};

use super::{draw_feeds, stopping, Event, FeedEntry, GraphRunner, InferenceExample};

impl GraphRunner {
  /// Every `interval`, starting one interval from now, evaluates `output` on
  /// `example_count` fresh examples and publishes them as
  /// [Event::InferenceExamples]. The reported inputs come from the first feed.
  ///
  /// Returns the number of passes made. A failed pass ends the schedule with
  /// [Error::InferenceStep].
  #[tracing::instrument(skip_all, fields(interval_ms = interval.as_millis() as u64, example_count = example_count))]
  pub async fn infer(
    &self,
    output: GraphTensor,
    mut feeds: Vec<FeedEntry>,
    interval: Duration,
    example_count: usize,
    mut shutdown: watch::Receiver<bool>,
  ) -> Result<u64> {
    if interval.is_zero() {
      return Err(Error::Config("inference interval must be positive".into()));
    }
    if example_count == 0 {
      return Err(Error::Config("inference example count must be positive".into()));
    }
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut passes = 0u64;
    info!("inference schedule started");

    loop {
      let fired = tokio::select! {
        _ = ticker.tick() => true,
        _ = shutdown.changed() => false,
      };
      if stopping(&shutdown) {
        break;
      }
      if !fired {
        continue;
      }

      let batch = draw_feeds(&mut feeds, example_count).map_err(Error::inference_step)?;
      let inputs = batch.first().map(|f| f.data.unstack()).unwrap_or_default();
      let outputs = self
        .device
        .execute(move |session| session.eval(output, &batch))
        .await
        .map_err(Error::inference_step)?;

      let examples = inputs
        .into_iter()
        .zip(outputs.unstack())
        .map(|(input, output)| InferenceExample { input, output })
        .collect();
      passes += 1;
      debug!(passes, "inference pass");
      self.emit(Event::InferenceExamples(examples));
    }

    info!(passes, "inference schedule stopped");
    Ok(passes)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  };

  use super::*;
  use crate::{
    graph::{Adadelta, Feed},
    runner::{
      tests::{drain, fixture, fixture_on, ScriptedProvider, WIDTH},
      ExecutionMode, TrainingOptions,
    },
    tensor::Tensor,
  };

  fn provider(fail_after: Option<u64>) -> ScriptedProvider {
    ScriptedProvider {
      drawn: Arc::new(AtomicU64::new(0)),
      fail_after,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn fires_once_per_interval() {
    let mut f = fixture();
    let (tx, rx) = watch::channel(false);
    let (runner, output) = (f.runner.clone(), f.output);
    let feeds = vec![FeedEntry::new(f.input, provider(None))];
    let handle =
      tokio::spawn(async move { runner.infer(output, feeds, Duration::from_millis(10_000), 5, rx).await });

    tokio::time::sleep(Duration::from_millis(25_000)).await;
    tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), 2);

    let events = drain(&mut f.events);
    assert_eq!(events.len(), 2);
    for event in events {
      let Event::InferenceExamples(examples) = event else {
        panic!("unexpected event {event:?}");
      };
      assert_eq!(examples.len(), 5);
      for e in examples {
        assert_eq!(e.input.shape(), &[WIDTH]);
        assert_eq!(e.output.shape(), &[WIDTH]);
      }
    }
  }

  #[tokio::test(start_paused = true)]
  async fn zero_example_count_is_rejected() {
    let mut f = fixture();
    let (_tx, rx) = watch::channel(false);
    let feeds = vec![FeedEntry::new(f.input, provider(None))];
    let err = f
      .runner
      .infer(f.output, feeds, Duration::from_millis(100), 0, rx)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(drain(&mut f.events).is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn failed_pass_stops_the_schedule() {
    let mut f = fixture();
    let (_tx, rx) = watch::channel(false);
    let feeds = vec![FeedEntry::new(f.input, provider(Some(0)))];
    let err = f
      .runner
      .infer(f.output, feeds, Duration::from_millis(100), 2, rx)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InferenceStep { .. }));
    assert!(drain(&mut f.events).is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn runs_alongside_training_on_one_device() {
    let mut f = fixture();
    let (tx, rx) = watch::channel(false);
    let (trainer, sampler) = (f.runner.clone(), f.runner.clone());
    let train_feeds = vec![FeedEntry::new(f.input, provider(None))];
    let infer_feeds = vec![FeedEntry::new(f.input, provider(None))];
    let options = TrainingOptions {
      batch_size: 4,
      cost_window: 5,
      metrics_interval: Duration::from_millis(500),
      max_batches: None,
    };
    let (cost, output, train_rx) = (f.cost, f.output, rx.clone());
    let training = tokio::spawn(async move {
      trainer
        .train(cost, train_feeds, options, Box::new(Adadelta::new(0.01, 0.01)), train_rx)
        .await
    });
    let inference =
      tokio::spawn(async move { sampler.infer(output, infer_feeds, Duration::from_millis(50), 3, rx).await });

    // training never sleeps, so move the clock by hand
    for _ in 0..4 {
      for _ in 0..10 {
        tokio::task::yield_now().await;
      }
      tokio::time::advance(Duration::from_millis(60)).await;
    }
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
    tx.send(true).unwrap();
    let trained = training.await.unwrap().unwrap();
    let passes = inference.await.unwrap().unwrap();

    assert!(trained > 0);
    assert!(passes > 0);
    assert_eq!(f.runner.total_batches_trained(), trained);
    let events = drain(&mut f.events);
    let inference_events = events
      .iter()
      .filter(|e| matches!(e, Event::InferenceExamples(_)))
      .count() as u64;
    assert_eq!(inference_events, passes);
    let batches = events.iter().filter(|e| matches!(e, Event::BatchesTrained(_))).count() as u64;
    assert_eq!(batches, trained);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn blocking_device_keeps_training_and_inference_apart() {
    let mut f = fixture_on(ExecutionMode::Blocking);
    let (tx, rx) = watch::channel(false);
    let (trainer, sampler) = (f.runner.clone(), f.runner.clone());
    let options = TrainingOptions {
      batch_size: 4,
      cost_window: 5,
      metrics_interval: Duration::from_millis(50),
      max_batches: None,
    };
    let (cost, output, train_rx) = (f.cost, f.output, rx.clone());
    let train_feeds = vec![FeedEntry::new(f.input, provider(None))];
    let infer_feeds = vec![FeedEntry::new(f.input, provider(None))];
    let training = tokio::spawn(async move {
      trainer
        .train(cost, train_feeds, options, Box::new(Adadelta::new(0.01, 0.01)), train_rx)
        .await
    });
    let inference =
      tokio::spawn(async move { sampler.infer(output, infer_feeds, Duration::from_millis(20), 3, rx).await });

    // no step may land between two evaluations made under one lock
    let batch = Tensor::new(&[3, WIDTH], (0..3 * WIDTH).map(|i| (i % 5) as f32 / 5.0).collect()).unwrap();
    let deadline = Instant::now() + Duration::from_millis(300);
    let mut checks = 0;
    while Instant::now() < deadline {
      let feeds = vec![Feed::new(f.input, batch.clone())];
      let counter = f.runner.total_batches_trained.clone();
      let (before, first, second, after) = f
        .runner
        .device()
        .execute(move |session| {
          let before = counter.load(Ordering::SeqCst);
          let first = session.eval(output, &feeds)?;
          let second = session.eval(output, &feeds)?;
          Ok((before, first, second, counter.load(Ordering::SeqCst)))
        })
        .await
        .unwrap();
      assert_eq!(first, second);
      assert_eq!(before, after);
      checks += 1;
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();
    let trained = training.await.unwrap().unwrap();
    let passes = inference.await.unwrap().unwrap();

    assert!(checks > 0);
    assert!(trained > 0);
    assert!(passes > 0);
    assert_eq!(f.runner.total_batches_trained(), trained);
    for event in drain(&mut f.events) {
      if let Event::InferenceExamples(examples) = event {
        assert_eq!(examples.len(), 3);
        assert!(examples.iter().all(|e| e.output.shape() == [WIDTH]));
      }
    }
  }
}
