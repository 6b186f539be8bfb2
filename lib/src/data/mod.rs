//! In-memory datasets: loading, per-channel normalization and partitioning.
//!
//! A dataset holds one column of example tensors per data source ("channel").
//! Every channel has the same number of examples and the k-th example of each
//! channel belongs together (image k and label k).

pub mod loader;
pub mod provider;

use tracing::debug;

use crate::{
  error::{Error, Result},
  tensor::Tensor,
};

pub use loader::{fetch_config, load_and_cache, DataSource, DataType, DatasetConfig};
pub use provider::{InputProvider, ShuffledInputProvider, ShuffledInputProviderBuilder};

/// Example columns, one per channel.
pub type Columns = Vec<Vec<Tensor>>;

/// Per-dimension value range of a channel and the bounds it was mapped into.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
  pub min: Vec<f32>,
  pub max: Vec<f32>,
  pub lower: f32,
  pub upper: f32,
}

impl Normalization {
  fn fit(examples: &[Tensor], lower: f32, upper: f32) -> Result<Self> {
    let width = examples.first().map(Tensor::len).unwrap_or(0);
    let mut min = vec![f32::INFINITY; width];
    let mut max = vec![f32::NEG_INFINITY; width];
    for example in examples {
      if example.len() != width {
        return Err(Error::DataLength {
          expected: width,
          got: example.len(),
        });
      }
      for (i, &v) in example.data().iter().enumerate() {
        min[i] = min[i].min(v);
        max[i] = max[i].max(v);
      }
    }
    Ok(Self { min, max, lower, upper })
  }

  fn check_width(&self, t: &Tensor) -> Result<()> {
    if t.len() != self.min.len() {
      return Err(Error::DataLength {
        expected: self.min.len(),
        got: t.len(),
      });
    }
    Ok(())
  }

  pub fn normalize(&self, t: &Tensor) -> Result<Tensor> {
    self.check_width(t)?;
    let mut out = t.clone();
    let span = self.upper - self.lower;
    for (i, v) in out.data_mut().iter_mut().enumerate() {
      let (lo, hi) = (self.min[i], self.max[i]);
      *v = if hi > lo {
        self.lower + (*v - lo) / (hi - lo) * span
      } else {
        self.lower
      };
    }
    Ok(out)
  }

  /// Maps a tensor from `[lower, upper]` back into the channel's original range.
  /// Constant dimensions come back as their constant.
  pub fn denormalize(&self, t: &Tensor) -> Result<Tensor> {
    self.check_width(t)?;
    let mut out = t.clone();
    let span = self.upper - self.lower;
    for (i, v) in out.data_mut().iter_mut().enumerate() {
      let (lo, hi) = (self.min[i], self.max[i]);
      *v = if hi > lo {
        lo + (*v - self.lower) / span * (hi - lo)
      } else {
        lo
      };
    }
    Ok(out)
  }
}

#[derive(Debug, Clone)]
struct Channel {
  name: String,
  examples: Vec<Tensor>,
  normalization: Option<Normalization>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
  channels: Vec<Channel>,
  label_class_names: Vec<String>,
}

impl Dataset {
  /// Builds a dataset from named channels. All channels need the same example count.
  pub fn from_channels(channels: Vec<(String, Vec<Tensor>)>, label_class_names: Vec<String>) -> Result<Self> {
    if let Some((first, rest)) = channels.split_first() {
      if let Some((name, examples)) = rest.iter().find(|(_, e)| e.len() != first.1.len()) {
        return Err(Error::Dataset(format!(
          "channel '{name}' has {} examples, '{}' has {}",
          examples.len(),
          first.0,
          first.1.len()
        )));
      }
    }
    let channels = channels
      .into_iter()
      .map(|(name, examples)| Channel {
        name,
        examples,
        normalization: None,
      })
      .collect();
    Ok(Self {
      channels,
      label_class_names,
    })
  }

  fn channel_ref(&self, channel: usize) -> Result<&Channel> {
    self
      .channels
      .get(channel)
      .ok_or_else(|| Error::Dataset(format!("no channel {channel}, dataset has {}", self.channels.len())))
  }

  fn channel_mut(&mut self, channel: usize) -> Result<&mut Channel> {
    let count = self.channels.len();
    self
      .channels
      .get_mut(channel)
      .ok_or_else(|| Error::Dataset(format!("no channel {channel}, dataset has {count}")))
  }

  /// Number of examples per channel.
  pub fn len(&self) -> usize {
    self.channels.first().map(|c| c.examples.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn channel_count(&self) -> usize {
    self.channels.len()
  }

  pub fn channel_name(&self, channel: usize) -> Result<&str> {
    Ok(&self.channel_ref(channel)?.name)
  }

  pub fn examples(&self, channel: usize) -> Result<&[Tensor]> {
    Ok(&self.channel_ref(channel)?.examples)
  }

  pub fn label_class_names(&self) -> &[String] {
    &self.label_class_names
  }

  pub fn normalization(&self, channel: usize) -> Result<Option<&Normalization>> {
    Ok(self.channel_ref(channel)?.normalization.as_ref())
  }

  /// Rescales every dimension of `channel` into `[lower, upper]` based on its
  /// min/max over all examples. A previous normalization is undone first.
  pub fn normalize_within_bounds(&mut self, channel: usize, lower: f32, upper: f32) -> Result<()> {
    if !(upper > lower) {
      return Err(Error::Dataset(format!(
        "normalization bounds must satisfy lower < upper, got [{lower}, {upper}]"
      )));
    }
    let ch = self.channel_mut(channel)?;
    if let Some(previous) = ch.normalization.take() {
      ch.examples = ch
        .examples
        .iter()
        .map(|e| previous.denormalize(e))
        .collect::<Result<_>>()?;
    }
    let normalization = Normalization::fit(&ch.examples, lower, upper)?;
    ch.examples = ch
      .examples
      .iter()
      .map(|e| normalization.normalize(e))
      .collect::<Result<_>>()?;
    debug!(channel = %ch.name, lower, upper, "normalized channel");
    ch.normalization = Some(normalization);
    Ok(())
  }

  /// Maps normalized tensors of `channel` back into the original value range.
  /// Tensors of a channel that was never normalized are returned as they are.
  pub fn denormalize_examples(&self, examples: &[Tensor], channel: usize) -> Result<Vec<Tensor>> {
    match &self.channel_ref(channel)?.normalization {
      Some(n) => examples.iter().map(|e| n.denormalize(e)).collect(),
      None => Ok(examples.to_vec()),
    }
  }

  /// Gives every example of `channel` a new shape with the same element count.
  pub fn reshape_channel(&mut self, channel: usize, shape: &[usize]) -> Result<()> {
    let ch = self.channel_mut(channel)?;
    ch.examples = ch
      .examples
      .iter()
      .map(|e| e.clone().reshape(shape))
      .collect::<Result<_>>()?;
    Ok(())
  }

  /// Splits every channel by index: the first `floor(ratio * len)` examples go to
  /// the first partition, the rest to the second.
  pub fn split(&self, ratio: f32) -> Result<(Columns, Columns)> {
    if !(0.0..=1.0).contains(&ratio) {
      return Err(Error::Dataset(format!("split ratio {ratio} is outside [0, 1]")));
    }
    let splitting_point = (self.len() as f32 * ratio) as usize;
    Ok(
      self
        .channels
        .iter()
        .map(|c| {
          let (head, tail) = c.examples.split_at(splitting_point);
          (head.to_vec(), tail.to_vec())
        })
        .unzip(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn dataset(rows: &[[f32; 3]]) -> Dataset {
    let images = rows.iter().map(|r| Tensor::vector(r.to_vec())).collect();
    let labels = (0..rows.len()).map(|i| Tensor::scalar(i as f32)).collect();
    Dataset::from_channels(vec![("images".into(), images), ("labels".into(), labels)], vec![]).unwrap()
  }

  #[test]
  fn normalization_maps_into_bounds_and_back() {
    let rows = [[0.0, 10.0, 7.0], [255.0, 20.0, 7.0], [51.0, 15.0, 7.0]];
    let mut ds = dataset(&rows);
    ds.normalize_within_bounds(0, 0.0, 1.0).unwrap();

    let normalized = ds.examples(0).unwrap();
    assert_eq!(normalized[0].data(), &[0.0, 0.0, 0.0]);
    assert_eq!(normalized[1].data(), &[1.0, 1.0, 0.0]);
    assert!((normalized[2].data()[0] - 0.2).abs() < 1e-6);
    assert!((normalized[2].data()[1] - 0.5).abs() < 1e-6);

    let restored = ds.denormalize_examples(normalized, 0).unwrap();
    for (r, original) in restored.iter().zip(rows) {
      for (a, b) in r.data().iter().zip(original) {
        assert!((a - b).abs() < 1e-3, "{a} vs {b}");
      }
    }
    // constant dimension comes back as its constant
    assert_eq!(restored[0].data()[2], 7.0);
  }

  #[test]
  fn renormalizing_starts_from_original_values() {
    let mut ds = dataset(&[[0.0, 2.0, 4.0], [10.0, 6.0, 8.0]]);
    ds.normalize_within_bounds(0, 0.0, 1.0).unwrap();
    ds.normalize_within_bounds(0, -1.0, 1.0).unwrap();
    assert_eq!(ds.examples(0).unwrap()[0].data(), &[-1.0, -1.0, -1.0]);
    let n = ds.normalization(0).unwrap().unwrap();
    assert_eq!(n.min, vec![0.0, 2.0, 4.0]);
    assert_eq!(n.max, vec![10.0, 6.0, 8.0]);
  }

  #[test]
  fn invalid_bounds_and_channels_are_rejected() {
    let mut ds = dataset(&[[0.0, 1.0, 2.0]]);
    assert!(matches!(ds.normalize_within_bounds(0, 1.0, 1.0), Err(Error::Dataset(_))));
    assert!(matches!(ds.normalize_within_bounds(5, 0.0, 1.0), Err(Error::Dataset(_))));
    assert!(ds.normalization(0).unwrap().is_none());
  }

  #[test]
  fn untouched_channel_denormalizes_to_itself() {
    let ds = dataset(&[[3.0, 1.0, 2.0]]);
    let t = vec![Tensor::vector(vec![0.5, 0.5, 0.5])];
    assert_eq!(ds.denormalize_examples(&t, 0).unwrap(), t);
  }

  #[test]
  fn split_is_by_index_without_overlap() {
    let rows: Vec<[f32; 3]> = (0..100).map(|i| [i as f32, 0.0, 0.0]).collect();
    let ds = dataset(&rows);
    let (train, infer) = ds.split(0.9).unwrap();
    assert_eq!(train.len(), 2);
    assert_eq!(train[0].len(), 90);
    assert_eq!(infer[0].len(), 10);
    assert_eq!(train[1].len(), 90);
    assert_eq!(infer[1][0].item(), 90.0);
    let train_ids: Vec<f32> = train[1].iter().map(Tensor::item).collect();
    assert!(infer[1].iter().all(|l| !train_ids.contains(&l.item())));
    assert!(ds.split(1.5).is_err());
  }

  #[test]
  fn reshape_keeps_values() {
    let mut ds = dataset(&[[1.0, 2.0, 3.0]]);
    ds.reshape_channel(0, &[3, 1]).unwrap();
    assert_eq!(ds.examples(0).unwrap()[0].shape(), &[3, 1]);
    assert!(ds.reshape_channel(0, &[2]).is_err());
  }

  #[test]
  fn mismatched_channel_lengths_are_rejected() {
    let result = Dataset::from_channels(
      vec![
        ("a".into(), vec![Tensor::scalar(0.0)]),
        ("b".into(), vec![]),
      ],
      vec![],
    );
    assert!(matches!(result, Err(Error::Dataset(_))));
  }
}
