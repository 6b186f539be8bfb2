use std::collections::HashMap;

use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::{AdamW, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::{GraphTensor, Parameters};

/// An update rule applied to the parameters once gradients are computed.
///
/// Parameters without a gradient (not reachable from the cost) are skipped.
pub trait Optimizer: Send {
  fn step(&mut self, parameters: &Parameters, grads: &GradStore) -> Result<()>;
}

fn vars(parameters: &Parameters) -> Vec<Var> {
  parameters.values().cloned().collect()
}

/// Wraps a candle-nn optimizer, created against the parameters on first use.
struct Lazy<O: candle_nn::Optimizer> {
  config: O::Config,
  inner: Option<O>,
}

impl<O> Lazy<O>
where
  O: candle_nn::Optimizer,
  O::Config: Clone,
{
  fn new(config: O::Config) -> Self {
    Self { config, inner: None }
  }

  fn step(&mut self, parameters: &Parameters, grads: &GradStore) -> Result<()> {
    let inner = match &mut self.inner {
      Some(inner) => inner,
      none => none.insert(O::new(vars(parameters), self.config.clone())?),
    };
    inner.step(grads)?;
    Ok(())
  }
}

/// Stochastic gradient descent
pub struct Sgd {
  inner: Lazy<SGD>,
}

impl Sgd {
  pub fn new(learning_rate: f64) -> Self {
    Self {
      inner: Lazy::new(learning_rate),
    }
  }
}

impl Optimizer for Sgd {
  fn step(&mut self, parameters: &Parameters, grads: &GradStore) -> Result<()> {
    self.inner.step(parameters, grads)
  }
}

/// Adam with decoupled weight decay
pub struct Adam {
  inner: Lazy<AdamW>,
}

impl Adam {
  pub fn new(params: ParamsAdamW) -> Self {
    Self {
      inner: Lazy::new(params),
    }
  }
}

impl Optimizer for Adam {
  fn step(&mut self, parameters: &Parameters, grads: &GradStore) -> Result<()> {
    self.inner.step(parameters, grads)
  }
}

/// Gradient descent with momentum
#[derive(Debug, Clone)]
pub struct Momentum {
  pub learning_rate: f64,
  pub momentum: f64,
  velocity: HashMap<GraphTensor, Tensor>,
}

impl Momentum {
  pub fn new(learning_rate: f64, momentum: f64) -> Self {
    Self {
      learning_rate,
      momentum,
      velocity: HashMap::new(),
    }
  }
}

impl Optimizer for Momentum {
  fn step(&mut self, parameters: &Parameters, grads: &GradStore) -> Result<()> {
    let mut updates = Vec::with_capacity(parameters.len());
    for (&t, var) in parameters {
      let Some(grad) = grads.get(var) else { continue };
      let velocity = match self.velocity.get(&t) {
        Some(v) => v.affine(self.momentum, 0.0)?.add(grad)?,
        None => grad.clone(),
      };
      let value = var.sub(&velocity.affine(self.learning_rate, 0.0)?)?;
      updates.push((t, var, velocity, value));
    }
    for (t, var, velocity, value) in updates {
      var.set(&value)?;
      self.velocity.insert(t, velocity);
    }
    Ok(())
  }
}

/// Adadelta: per-parameter step sizes from running averages of squared
/// gradients and squared updates, decayed by `gamma`.
#[derive(Debug, Clone)]
pub struct Adadelta {
  pub learning_rate: f64,
  pub gamma: f64,
  pub epsilon: f64,
  accumulated_sq_grads: HashMap<GraphTensor, Tensor>,
  accumulated_sq_updates: HashMap<GraphTensor, Tensor>,
}

impl Adadelta {
  pub fn new(learning_rate: f64, gamma: f64) -> Self {
    Self {
      learning_rate,
      gamma,
      epsilon: 1e-6,
      accumulated_sq_grads: HashMap::new(),
      accumulated_sq_updates: HashMap::new(),
    }
  }
}

impl Optimizer for Adadelta {
  fn step(&mut self, parameters: &Parameters, grads: &GradStore) -> Result<()> {
    let (gamma, eps) = (self.gamma, self.epsilon);
    let mut updates = Vec::with_capacity(parameters.len());
    for (&t, var) in parameters {
      let Some(grad) = grads.get(var) else { continue };
      let sq_grads = match self.accumulated_sq_grads.get(&t) {
        Some(acc) => acc.affine(gamma, 0.0)?,
        None => grad.zeros_like()?,
      }
      .add(&grad.sqr()?.affine(1.0 - gamma, 0.0)?)?;
      let prev_sq_updates = match self.accumulated_sq_updates.get(&t) {
        Some(acc) => acc.clone(),
        None => grad.zeros_like()?,
      };
      let update = prev_sq_updates
        .affine(1.0, eps)?
        .sqrt()?
        .div(&sq_grads.affine(1.0, eps)?.sqrt()?)?
        .mul(grad)?;
      let sq_updates = prev_sq_updates
        .affine(gamma, 0.0)?
        .add(&update.sqr()?.affine(1.0 - gamma, 0.0)?)?;
      let value = var.sub(&update.affine(self.learning_rate, 0.0)?)?;
      updates.push((t, var, sq_grads, sq_updates, value));
    }
    for (t, var, sq_grads, sq_updates, value) in updates {
      var.set(&value)?;
      self.accumulated_sq_grads.insert(t, sq_grads);
      self.accumulated_sq_updates.insert(t, sq_updates);
    }
    Ok(())
  }
}

/// Serializable optimizer selection, as found in run configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerConfig {
  Sgd { learning_rate: f64 },
  Momentum { learning_rate: f64, momentum: f64 },
  Adadelta { learning_rate: f64, gamma: f64 },
  Adam { learning_rate: f64 },
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    OptimizerConfig::Adadelta {
      learning_rate: 0.01,
      gamma: 0.01,
    }
  }
}

impl OptimizerConfig {
  pub fn build(&self) -> Box<dyn Optimizer> {
    match *self {
      OptimizerConfig::Sgd { learning_rate } => Box::new(Sgd::new(learning_rate)),
      OptimizerConfig::Momentum {
        learning_rate,
        momentum,
      } => Box::new(Momentum::new(learning_rate, momentum)),
      OptimizerConfig::Adadelta { learning_rate, gamma } => Box::new(Adadelta::new(learning_rate, gamma)),
      OptimizerConfig::Adam { learning_rate } => Box::new(Adam::new(ParamsAdamW {
        lr: learning_rate,
        weight_decay: 0.0,
        ..ParamsAdamW::default()
      })),
    }
  }
}
