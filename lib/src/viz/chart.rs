use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
  pub x: f64,
  pub y: f64,
}

/// Append-only line series with non-decreasing x.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
  pub label: String,
  points: Vec<ChartPoint>,
}

/// The tail of a series a client has not seen yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartUpdate {
  pub label: String,
  /// Index of the first point in `points`.
  pub from: usize,
  /// Length of the whole series.
  pub total: usize,
  pub points: Vec<ChartPoint>,
}

impl ChartSeries {
  pub fn new(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      points: Vec::new(),
    }
  }

  /// Appends a point. A point left of the last one is dropped and `false` returned.
  pub fn push(&mut self, x: f64, y: f64) -> bool {
    let last = self.points.last().map(|p| p.x);
    if x.is_nan() || last.is_some_and(|last| x < last) {
      warn!(series = %self.label, x, ?last, "dropping out-of-order chart point");
      return false;
    }
    self.points.push(ChartPoint { x, y });
    true
  }

  pub fn points(&self) -> &[ChartPoint] {
    &self.points
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// Points from index `from` on. Past the end this is empty, so a client that
  /// knows more points than the series holds sees `total` shrink and starts over.
  pub fn since(&self, from: usize) -> ChartUpdate {
    let from = from.min(self.points.len());
    ChartUpdate {
      label: self.label.clone(),
      from,
      total: self.points.len(),
      points: self.points[from..].to_vec(),
    }
  }
}
