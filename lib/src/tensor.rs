use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Host-side copy of a tensor: dataset examples, fed batches and inference
/// results. All math runs on candle tensors; this type only crosses the
/// boundary to providers, events and the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
  shape: Vec<usize>,
  data: Vec<f32>,
}

fn size_of(shape: &[usize]) -> usize {
  shape.iter().product()
}

impl Tensor {
  pub fn new(shape: &[usize], data: Vec<f32>) -> Result<Self> {
    let expected = size_of(shape);
    if expected != data.len() {
      return Err(Error::DataLength {
        expected,
        got: data.len(),
      });
    }
    Ok(Self {
      shape: shape.to_vec(),
      data,
    })
  }

  pub fn vector(data: Vec<f32>) -> Self {
    Self {
      shape: vec![data.len()],
      data,
    }
  }

  pub fn scalar(value: f32) -> Self {
    Self {
      shape: vec![],
      data: vec![value],
    }
  }

  pub fn filled(shape: &[usize], value: f32) -> Self {
    Self {
      shape: shape.to_vec(),
      data: vec![value; size_of(shape)],
    }
  }

  pub fn zeros(shape: &[usize]) -> Self {
    Self::filled(shape, 0.0)
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  pub fn data_mut(&mut self) -> &mut [f32] {
    &mut self.data
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// First element, the value of a scalar.
  pub fn item(&self) -> f32 {
    self.data.first().copied().unwrap_or(0.0)
  }

  pub fn reshape(self, shape: &[usize]) -> Result<Self> {
    Self::new(shape, self.data)
  }

  /// Stack same-shaped examples into one batch with a leading row dimension.
  pub fn stack(examples: &[Tensor]) -> Result<Tensor> {
    let first = examples
      .first()
      .ok_or_else(|| Error::Config("cannot stack an empty batch".into()))?;
    let mut data = Vec::with_capacity(first.len() * examples.len());
    for example in examples {
      if example.shape != first.shape {
        return Err(Error::ShapeMismatch {
          op: "stack",
          left: first.shape.clone(),
          right: example.shape.clone(),
        });
      }
      data.extend_from_slice(&example.data);
    }
    let mut shape = vec![examples.len()];
    shape.extend_from_slice(&first.shape);
    Ok(Tensor { shape, data })
  }

  /// Split a batch back into its examples.
  pub fn unstack(&self) -> Vec<Tensor> {
    let Some((&rows, inner)) = self.shape.split_first() else {
      return vec![self.clone()];
    };
    let width = size_of(inner);
    self
      .data
      .chunks_exact(width.max(1))
      .take(rows)
      .map(|row| Tensor {
        shape: inner.to_vec(),
        data: row.to_vec(),
      })
      .collect()
  }

  /// Uploads to `device` as an f32 tensor of the same shape.
  pub fn to_candle(&self, device: &candle_core::Device) -> Result<candle_core::Tensor> {
    Ok(candle_core::Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
  }

  /// Copies an f32 candle tensor back to the host.
  pub fn from_candle(t: &candle_core::Tensor) -> Result<Self> {
    let data = t.flatten_all()?.to_vec1::<f32>()?;
    Self::new(t.dims(), data)
  }
}
