use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{
  error::{Error, Result},
  tensor::Tensor,
};

/// Produces the initial value of a variable.
pub trait Initializer {
  fn initialize<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Tensor;
}

#[derive(Debug, Clone, Copy)]
pub struct RandomNormalInitializer {
  normal: Normal<f32>,
}

impl RandomNormalInitializer {
  pub fn new(mean: f32, stdev: f32) -> Result<Self> {
    let normal = Normal::new(mean, stdev)
      .map_err(|e| Error::GraphConstruction(format!("normal({mean}, {stdev}): {e}")))?;
    Ok(Self { normal })
  }
}

impl Initializer for RandomNormalInitializer {
  fn initialize<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Tensor {
    let mut t = Tensor::zeros(shape);
    t.data_mut().iter_mut().for_each(|v| *v = self.normal.sample(rng));
    t
  }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantInitializer {
  pub value: f32,
}

impl ConstantInitializer {
  pub fn new(value: f32) -> Self {
    Self { value }
  }
}

impl Initializer for ConstantInitializer {
  fn initialize<R: Rng + ?Sized>(&self, shape: &[usize], _rng: &mut R) -> Tensor {
    Tensor::filled(shape, self.value)
  }
}
