use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc::UnboundedReceiver, RwLock};
use tracing::{debug, info};

use crate::{
  data::Normalization,
  error::Result,
  runner::{Event, InferenceExample},
  tensor::Tensor,
};

use super::{to_image_data, Canvas, ChartSeries, ChartUpdate, RasterSurface};

/// Headline numbers, as shown next to the chart. Never reset within a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsState {
  pub total_batches_trained: u64,
  pub train_examples_per_sec: f32,
  pub total_time_sec: f32,
  pub cost: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanvasPair {
  pub input: Canvas,
  pub output: Canvas,
}

/// Everything the page needs for one redraw. The chart only carries the
/// points the page asked for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
  pub metrics: MetricsState,
  pub chart: ChartUpdate,
  pub canvases: Vec<CanvasPair>,
}

/// Dashboard state, folded from runner events.
#[derive(Debug)]
pub struct Dashboard {
  metrics: MetricsState,
  cost_chart: ChartSeries,
  canvases: Vec<CanvasPair>,
  image_size: usize,
  /// Maps model space back to pixel values.
  normalization: Option<Normalization>,
}

impl Dashboard {
  /// `example_count` input/output canvas pairs of `image_size` squared pixels.
  pub fn new(example_count: usize, image_size: usize, normalization: Option<Normalization>) -> Self {
    let canvases = (0..example_count)
      .map(|_| CanvasPair {
        input: Canvas::new(image_size, image_size),
        output: Canvas::new(image_size, image_size),
      })
      .collect();
    Self {
      metrics: MetricsState::default(),
      cost_chart: ChartSeries::new("cost"),
      canvases,
      image_size,
      normalization,
    }
  }

  pub fn metrics(&self) -> &MetricsState {
    &self.metrics
  }

  pub fn cost_chart(&self) -> &ChartSeries {
    &self.cost_chart
  }

  pub fn canvases(&self) -> &[CanvasPair] {
    &self.canvases
  }

  fn draw(&self, canvas: &mut Canvas, t: &Tensor) -> Result<()> {
    let values = match &self.normalization {
      Some(n) => n.denormalize(t)?,
      None => t.clone(),
    };
    let image = to_image_data(values.data(), self.image_size, self.image_size)?;
    canvas.put_image_data(&image, 0, 0);
    Ok(())
  }

  fn draw_examples(&mut self, examples: &[InferenceExample]) -> Result<()> {
    if examples.len() > self.canvases.len() {
      debug!(
        examples = examples.len(),
        canvases = self.canvases.len(),
        "more inference examples than canvases"
      );
    }
    let mut canvases = std::mem::take(&mut self.canvases);
    let drawn = canvases
      .iter_mut()
      .zip(examples)
      .try_for_each(|(pair, example)| {
        self.draw(&mut pair.input, &example.input)?;
        self.draw(&mut pair.output, &example.output)
      });
    self.canvases = canvases;
    drawn
  }

  /// Folds one runner event into the state.
  pub fn apply(&mut self, event: &Event) -> Result<()> {
    match event {
      Event::BatchesTrained(total) => {
        self.metrics.total_batches_trained = self.metrics.total_batches_trained.max(*total);
      }
      Event::AverageCost { batch, cost } => {
        self.metrics.cost = *cost;
        self.cost_chart.push(*batch as f64, *cost as f64);
      }
      Event::ExamplesPerSec(rate) => self.metrics.train_examples_per_sec = *rate,
      Event::TotalTime(seconds) => {
        self.metrics.total_time_sec = self.metrics.total_time_sec.max(*seconds);
      }
      Event::InferenceExamples(examples) => self.draw_examples(examples)?,
    }
    Ok(())
  }

  /// Current state, with cost points from index `chart_from` on.
  pub fn snapshot(&self, chart_from: usize) -> DashboardSnapshot {
    DashboardSnapshot {
      metrics: self.metrics.clone(),
      chart: self.cost_chart.since(chart_from),
      canvases: self.canvases.clone(),
    }
  }
}

/// Applies events to the shared dashboard until every sender is gone.
#[tracing::instrument(skip_all)]
pub async fn run_dashboard(dashboard: Arc<RwLock<Dashboard>>, mut events: UnboundedReceiver<Event>) -> Result<()> {
  let mut applied = 0u64;
  while let Some(event) = events.recv().await {
    dashboard.write().await.apply(&event)?;
    applied += 1;
  }
  info!(applied, "event stream closed");
  Ok(())
}

#[cfg(test)]
mod tests {
  use tokio::sync::mpsc;

  use super::*;
  use crate::viz::ChartPoint;

  fn normalization(width: usize) -> Normalization {
    Normalization {
      min: vec![0.0; width],
      max: vec![255.0; width],
      lower: 0.0,
      upper: 1.0,
    }
  }

  #[test]
  fn metrics_follow_events() {
    let mut d = Dashboard::new(1, 2, None);
    d.apply(&Event::BatchesTrained(3)).unwrap();
    d.apply(&Event::AverageCost { batch: 3, cost: 0.25 }).unwrap();
    d.apply(&Event::ExamplesPerSec(640.0)).unwrap();
    d.apply(&Event::TotalTime(1.5)).unwrap();
    d.apply(&Event::BatchesTrained(2)).unwrap();

    let m = d.metrics();
    assert_eq!(m.total_batches_trained, 3);
    assert_eq!(m.cost, 0.25);
    assert_eq!(m.train_examples_per_sec, 640.0);
    assert_eq!(m.total_time_sec, 1.5);
    assert_eq!(d.cost_chart().points().len(), 1);
  }

  #[test]
  fn inference_examples_are_denormalized_into_canvases() {
    let mut d = Dashboard::new(2, 2, Some(normalization(4)));
    let example = InferenceExample {
      input: Tensor::vector(vec![0.0, 1.0, 0.5, 2.0]),
      output: Tensor::vector(vec![-1.0, 0.2, 0.4, 0.6]),
    };
    d.apply(&Event::InferenceExamples(vec![example])).unwrap();

    let pair = &d.canvases()[0];
    let input: Vec<u8> = pair.input.image().data.chunks(4).map(|px| px[0]).collect();
    assert_eq!(input, vec![0, 255, 128, 255]);
    let output: Vec<u8> = pair.output.image().data.chunks(4).map(|px| px[0]).collect();
    assert_eq!(output, vec![0, 51, 102, 153]);
    // second pair untouched
    assert_eq!(d.canvases()[1].input.revision(), 0);
  }

  #[test]
  fn malformed_inference_output_is_an_error() {
    let mut d = Dashboard::new(1, 2, None);
    let example = InferenceExample {
      input: Tensor::vector(vec![0.0; 4]),
      output: Tensor::vector(vec![0.0; 3]),
    };
    assert!(d.apply(&Event::InferenceExamples(vec![example])).is_err());
    assert_eq!(d.canvases().len(), 1);
  }

  #[test]
  fn snapshot_serializes_camel_case_metrics() {
    let mut d = Dashboard::new(1, 2, None);
    d.apply(&Event::BatchesTrained(7)).unwrap();
    let json = serde_json::to_value(d.snapshot(0)).unwrap();
    assert_eq!(json["metrics"]["totalBatchesTrained"], 7);
    assert_eq!(json["canvases"].as_array().unwrap().len(), 1);
    assert_eq!(json["chart"]["label"], "cost");
  }

  #[test]
  fn snapshot_carries_cost_points_after_the_requested_index() {
    let mut d = Dashboard::new(1, 2, None);
    for batch in [10, 20, 30] {
      d.apply(&Event::AverageCost { batch, cost: 0.5 }).unwrap();
    }
    let chart = d.snapshot(2).chart;
    assert_eq!((chart.from, chart.total), (2, 3));
    assert_eq!(chart.points, vec![ChartPoint { x: 30.0, y: 0.5 }]);
    assert!(d.snapshot(3).chart.points.is_empty());
  }

  #[tokio::test]
  async fn pump_applies_until_senders_are_gone() {
    let dashboard = Arc::new(RwLock::new(Dashboard::new(1, 2, None)));
    let (tx, rx) = mpsc::unbounded_channel();
    for n in 1..=5 {
      tx.send(Event::BatchesTrained(n)).unwrap();
    }
    drop(tx);
    run_dashboard(dashboard.clone(), rx).await.unwrap();
    assert_eq!(dashboard.read().await.metrics().total_batches_trained, 5);
  }
}
