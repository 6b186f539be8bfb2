use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
};

use candle_core::{backprop::GradStore, Device, Var};
use tracing::trace;

use crate::{
  error::{Error, Result},
  tensor::Tensor,
};

use super::{Graph, GraphTensor, Op, Optimizer};

/// Batch data bound to a placeholder for one evaluation: `[batch, ..placeholder shape]`.
#[derive(Debug, Clone)]
pub struct Feed {
  pub tensor: GraphTensor,
  pub data: Tensor,
}

impl Feed {
  pub fn new(tensor: GraphTensor, data: Tensor) -> Self {
    Self { tensor, data }
  }
}

/// Trainable state of a graph: one candle [Var] per variable node, ordered by handle.
pub type Parameters = BTreeMap<GraphTensor, Var>;

/// Current variable values bound to a graph.
#[derive(Debug)]
pub struct Session {
  graph: Arc<Graph>,
  device: Device,
  variables: Parameters,
}

impl Session {
  /// Uploads every variable's initial value to the CPU device.
  pub fn new(graph: Arc<Graph>) -> Result<Self> {
    let device = Device::Cpu;
    let mut variables = BTreeMap::new();
    for v in graph.variables() {
      if let Op::Variable(initial) = &graph.node(v)?.op {
        variables.insert(v, Var::from_tensor(&initial.to_candle(&device)?)?);
      }
    }
    Ok(Self {
      graph,
      device,
      variables,
    })
  }

  pub fn graph(&self) -> &Arc<Graph> {
    &self.graph
  }

  pub fn parameters(&self) -> &Parameters {
    &self.variables
  }

  /// Host copy of a variable's current value.
  pub fn variable(&self, t: GraphTensor) -> Result<Tensor> {
    let var = self.variables.get(&t).ok_or(Error::UnknownTensor)?;
    Tensor::from_candle(var.as_tensor())
  }

  pub fn set_variable(&mut self, t: GraphTensor, value: &Tensor) -> Result<()> {
    let var = self.variables.get(&t).ok_or(Error::UnknownTensor)?;
    if var.dims() != value.shape() {
      return Err(Error::ShapeMismatch {
        op: "set_variable",
        left: var.dims().to_vec(),
        right: value.shape().to_vec(),
      });
    }
    var.set(&value.to_candle(&self.device)?)?;
    Ok(())
  }

  fn operands<const N: usize>(&self, t: GraphTensor) -> Result<[GraphTensor; N]> {
    self
      .graph
      .inputs(t)
      .try_into()
      .map_err(|_| Error::GraphConstruction(format!("node {:?} has the wrong number of operands", t.id)))
  }

  fn feed_value(&self, t: GraphTensor, feeds: &[Feed]) -> Result<candle_core::Tensor> {
    let node = self.graph.node(t)?;
    let feed = feeds
      .iter()
      .find(|f| f.tensor == t)
      .ok_or_else(|| Error::MissingFeed(node.name.clone()))?;
    let shape = feed.data.shape();
    if shape.len() != node.shape.len() + 1 || shape[1..] != node.shape[..] {
      return Err(Error::ShapeMismatch {
        op: "feed",
        left: node.shape.clone(),
        right: shape.to_vec(),
      });
    }
    feed.data.to_candle(&self.device)
  }

  /// Builds the candle expression for `target` from its dependencies.
  fn forward(&self, target: GraphTensor, feeds: &[Feed]) -> Result<candle_core::Tensor> {
    let mut values: HashMap<GraphTensor, candle_core::Tensor> = HashMap::new();
    let value = |values: &HashMap<GraphTensor, candle_core::Tensor>, t: GraphTensor| {
      values.get(&t).cloned().ok_or(Error::UnknownTensor)
    };
    for t in self.graph.evaluation_order(target)? {
      let out = match &self.graph.node(t)?.op {
        Op::Variable(_) => self.variables.get(&t).ok_or(Error::UnknownTensor)?.as_tensor().clone(),
        Op::Placeholder => self.feed_value(t, feeds)?,
        Op::Add => {
          let [a, b] = self.operands::<2>(t)?;
          value(&values, a)?.broadcast_add(&value(&values, b)?)?
        }
        Op::MatMul => {
          let [a, b] = self.operands::<2>(t)?;
          value(&values, a)?.matmul(&value(&values, b)?)?
        }
        Op::Sigmoid => {
          let [a] = self.operands::<1>(t)?;
          candle_nn::ops::sigmoid(&value(&values, a)?)?
        }
        Op::MeanSquaredCost => {
          let [label, prediction] = self.operands::<2>(t)?;
          candle_nn::loss::mse(&value(&values, prediction)?, &value(&values, label)?)?
        }
      };
      values.insert(t, out);
    }
    values.remove(&target).ok_or(Error::UnknownTensor)
  }

  /// Forward pass only. Variables are left untouched.
  pub fn eval(&self, target: GraphTensor, feeds: &[Feed]) -> Result<Tensor> {
    Tensor::from_candle(&self.forward(target, feeds)?)
  }

  fn backward(&self, cost: GraphTensor, feeds: &[Feed]) -> Result<(f32, GradStore)> {
    if !self.graph.shape(cost)?.is_empty() {
      return Err(Error::GraphConstruction(format!(
        "cost '{}' is not a scalar",
        self.graph.name(cost)?
      )));
    }
    let loss = self.forward(cost, feeds)?;
    let grads = loss.backward()?;
    Ok((loss.to_scalar::<f32>()?, grads))
  }

  /// Cost value and host copies of the gradient for every variable the cost depends on.
  pub fn gradients(&self, cost: GraphTensor, feeds: &[Feed]) -> Result<(f32, HashMap<GraphTensor, Tensor>)> {
    let (loss, grads) = self.backward(cost, feeds)?;
    let mut out = HashMap::new();
    for (&t, var) in &self.variables {
      if let Some(grad) = grads.get(var) {
        out.insert(t, Tensor::from_candle(grad)?);
      }
    }
    Ok((loss, out))
  }

  /// One optimizer step minimizing `cost` over the fed batch. Returns the batch cost.
  ///
  /// The forward and backward passes finish before the optimizer runs, so a
  /// malformed batch leaves every variable unchanged.
  pub fn train(&mut self, cost: GraphTensor, feeds: &[Feed], optimizer: &mut dyn Optimizer) -> Result<f32> {
    let (loss, grads) = self.backward(cost, feeds)?;
    optimizer.step(&self.variables, &grads)?;
    trace!(cost = loss, "optimizer step");
    Ok(loss)
  }
}

#[cfg(test)]
mod tests {
  use rand::{rngs::StdRng, SeedableRng};

  use super::*;
  use crate::graph::{Initializer, RandomNormalInitializer, Sgd};

  struct Tiny {
    session: Session,
    input: GraphTensor,
    output: GraphTensor,
    cost: GraphTensor,
  }

  fn tiny_autoencoder() -> Tiny {
    let mut rng = StdRng::seed_from_u64(7);
    let init = RandomNormalInitializer::new(0.0, 0.5).unwrap();
    let mut g = Graph::new();
    let x = g.placeholder("x", &[3]).unwrap();
    let w1 = g.variable("w1", init.initialize(&[3, 2], &mut rng)).unwrap();
    let b1 = g.variable("b1", init.initialize(&[2], &mut rng)).unwrap();
    let w2 = g.variable("w2", init.initialize(&[2, 3], &mut rng)).unwrap();
    let b2 = g.variable("b2", init.initialize(&[3], &mut rng)).unwrap();
    let h = g.matmul(x, w1).unwrap();
    let h = g.add(h, b1).unwrap();
    let h = g.sigmoid(h).unwrap();
    let y = g.matmul(h, w2).unwrap();
    let y = g.add(y, b2).unwrap();
    let y = g.sigmoid(y).unwrap();
    let cost = g.mean_squared_cost(x, y).unwrap();
    Tiny {
      session: Session::new(Arc::new(g)).unwrap(),
      input: x,
      output: y,
      cost,
    }
  }

  fn batch(input: GraphTensor) -> Vec<Feed> {
    let data = Tensor::new(&[2, 3], vec![0.1, 0.9, 0.4, 0.7, 0.2, 0.0]).unwrap();
    vec![Feed::new(input, data)]
  }

  fn snapshot(session: &Session) -> Vec<Tensor> {
    session
      .graph()
      .variables()
      .into_iter()
      .map(|v| session.variable(v).unwrap())
      .collect()
  }

  #[test]
  fn eval_produces_batched_output() {
    let tiny = tiny_autoencoder();
    let out = tiny.session.eval(tiny.output, &batch(tiny.input)).unwrap();
    assert_eq!(out.shape(), &[2, 3]);
    assert!(out.data().iter().all(|&v| v > 0.0 && v < 1.0));
  }

  #[test]
  fn eval_leaves_variables_alone() {
    let tiny = tiny_autoencoder();
    let before = snapshot(&tiny.session);
    tiny.session.eval(tiny.cost, &batch(tiny.input)).unwrap();
    assert_eq!(snapshot(&tiny.session), before);
  }

  #[test]
  fn gradients_match_finite_differences() {
    let mut tiny = tiny_autoencoder();
    let feeds = batch(tiny.input);
    let (_, grads) = tiny.session.gradients(tiny.cost, &feeds).unwrap();
    assert_eq!(grads.len(), 4);

    let eps = 1e-2;
    for (&var, grad) in &grads {
      let original = tiny.session.variable(var).unwrap();
      for i in 0..original.len() {
        let mut plus = original.clone();
        plus.data_mut()[i] += eps;
        tiny.session.set_variable(var, &plus).unwrap();
        let up = tiny.session.eval(tiny.cost, &feeds).unwrap().item();

        let mut minus = original.clone();
        minus.data_mut()[i] -= eps;
        tiny.session.set_variable(var, &minus).unwrap();
        let down = tiny.session.eval(tiny.cost, &feeds).unwrap().item();

        tiny.session.set_variable(var, &original).unwrap();
        let numeric = (up - down) / (2.0 * eps);
        let analytic = grad.data()[i];
        assert!(
          (numeric - analytic).abs() <= 1e-3 + 0.05 * numeric.abs(),
          "variable {var:?}[{i}]: numeric {numeric} vs analytic {analytic}"
        );
      }
    }
  }

  #[test]
  fn sgd_steps_reduce_cost_on_a_fixed_batch() {
    let mut tiny = tiny_autoencoder();
    let feeds = batch(tiny.input);
    let mut sgd = Sgd::new(0.5);
    let first = tiny.session.train(tiny.cost, &feeds, &mut sgd).unwrap();
    let mut last = first;
    for _ in 0..50 {
      last = tiny.session.train(tiny.cost, &feeds, &mut sgd).unwrap();
    }
    assert!(last < first, "cost went from {first} to {last}");
  }

  #[test]
  fn malformed_feed_fails_without_touching_variables() {
    let mut tiny = tiny_autoencoder();
    let before = snapshot(&tiny.session);

    let bad = vec![Feed::new(tiny.input, Tensor::zeros(&[2, 4]))];
    let err = tiny.session.train(tiny.cost, &bad, &mut Sgd::new(1.0)).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { op: "feed", .. }));
    assert_eq!(snapshot(&tiny.session), before);
  }

  #[test]
  fn missing_feed_is_reported_by_name() {
    let tiny = tiny_autoencoder();
    assert!(matches!(
      tiny.session.eval(tiny.output, &[]),
      Err(Error::MissingFeed(name)) if name == "x"
    ));
  }

  #[test]
  fn set_variable_checks_shape() {
    let mut tiny = tiny_autoencoder();
    let w1 = tiny.session.graph().variables()[0];
    assert!(matches!(
      tiny.session.set_variable(w1, &Tensor::zeros(&[2, 3])),
      Err(Error::ShapeMismatch { op: "set_variable", .. })
    ));
  }
}
