//! Computation graph over candle.
//!
//! Graph: a DAG kept in one petgraph arena. Nodes are placeholders (fed per batch),
//! variables (trained state, with their initial value) and operations. Callers only
//! ever hold [GraphTensor] handles, which are plain node indices, so layers never
//! alias each other's nodes.
//!
//! Shapes recorded in the graph are per example. At runtime everything downstream
//! of a placeholder carries an extra leading batch dimension.
//!
//! [Session] binds a graph to candle `Var`s and lowers each node to the matching
//! candle op, so gradients come from candle's autograd.

pub mod init;
pub mod optimizer;
pub mod session;

use itertools::Itertools;
use petgraph::{
  algo::toposort,
  graph::{DiGraph, NodeIndex},
  visit::{Dfs, EdgeRef, Reversed},
  Direction::Incoming,
};

use crate::{
  error::{Error, Result},
  tensor::Tensor,
};

pub use init::{ConstantInitializer, Initializer, RandomNormalInitializer};
pub use optimizer::{Adadelta, Adam, Momentum, Optimizer, OptimizerConfig, Sgd};
pub use session::{Feed, Parameters, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphTensor {
  pub id: NodeIndex,
}

#[derive(Debug, Clone)]
pub enum Op {
  Placeholder,
  Variable(Tensor),
  Add,
  MatMul,
  Sigmoid,
  MeanSquaredCost,
}

#[derive(Debug, Clone)]
pub struct Node {
  pub name: String,
  pub op: Op,
  pub shape: Vec<usize>,
}

/// Edge weight is the argument position at the consuming node.
#[derive(Debug, Default)]
pub struct Graph {
  graph: DiGraph<Node, usize>,
}

impl Graph {
  pub fn new() -> Self {
    Self::default()
  }

  fn push(&mut self, name: String, op: Op, shape: Vec<usize>, inputs: &[GraphTensor]) -> GraphTensor {
    let id = self.graph.add_node(Node { name, op, shape });
    for (order, input) in inputs.iter().enumerate() {
      self.graph.add_edge(input.id, id, order);
    }
    GraphTensor { id }
  }

  fn check_dims(what: &str, shape: &[usize]) -> Result<()> {
    if shape.iter().any(|&d| d == 0) {
      return Err(Error::GraphConstruction(format!(
        "{what} has a zero-sized dimension: {shape:?}"
      )));
    }
    Ok(())
  }

  pub fn placeholder(&mut self, name: &str, shape: &[usize]) -> Result<GraphTensor> {
    Self::check_dims(name, shape)?;
    Ok(self.push(name.to_string(), Op::Placeholder, shape.to_vec(), &[]))
  }

  pub fn variable(&mut self, name: &str, initial: Tensor) -> Result<GraphTensor> {
    Self::check_dims(name, initial.shape())?;
    let shape = initial.shape().to_vec();
    Ok(self.push(name.to_string(), Op::Variable(initial), shape, &[]))
  }

  /// Elementwise sum. `b` may also be a variable broadcast over the batch rows of `a`.
  pub fn add(&mut self, a: GraphTensor, b: GraphTensor) -> Result<GraphTensor> {
    let (sa, sb) = (self.shape(a)?.to_vec(), self.shape(b)?.to_vec());
    if sa != sb {
      return Err(Error::GraphConstruction(format!("add: {sa:?} vs {sb:?}")));
    }
    let name = format!("add({}, {})", self.name(a)?, self.name(b)?);
    Ok(self.push(name, Op::Add, sa, &[a, b]))
  }

  /// Per-example `[k] x [k, n] -> [n]`.
  pub fn matmul(&mut self, a: GraphTensor, b: GraphTensor) -> Result<GraphTensor> {
    let (sa, sb) = (self.shape(a)?.to_vec(), self.shape(b)?.to_vec());
    match (sa.as_slice(), sb.as_slice()) {
      ([k], [k2, n]) if k == k2 => {
        let name = format!("matmul({}, {})", self.name(a)?, self.name(b)?);
        Ok(self.push(name, Op::MatMul, vec![*n], &[a, b]))
      }
      _ => Err(Error::GraphConstruction(format!("matmul: {sa:?} x {sb:?}"))),
    }
  }

  pub fn sigmoid(&mut self, a: GraphTensor) -> Result<GraphTensor> {
    let shape = self.shape(a)?.to_vec();
    let name = format!("sigmoid({})", self.name(a)?);
    Ok(self.push(name, Op::Sigmoid, shape, &[a]))
  }

  /// Scalar mean of squared differences, averaged over examples in the batch.
  pub fn mean_squared_cost(&mut self, label: GraphTensor, prediction: GraphTensor) -> Result<GraphTensor> {
    let (sl, sp) = (self.shape(label)?, self.shape(prediction)?);
    if sl != sp {
      return Err(Error::GraphConstruction(format!(
        "mean_squared_cost: {sl:?} vs {sp:?}"
      )));
    }
    Ok(self.push("mean_squared_cost".into(), Op::MeanSquaredCost, vec![], &[label, prediction]))
  }

  pub fn node(&self, t: GraphTensor) -> Result<&Node> {
    self.graph.node_weight(t.id).ok_or(Error::UnknownTensor)
  }

  pub fn shape(&self, t: GraphTensor) -> Result<&[usize]> {
    Ok(&self.node(t)?.shape)
  }

  pub fn name(&self, t: GraphTensor) -> Result<&str> {
    Ok(&self.node(t)?.name)
  }

  /// Operands of `t` in argument order.
  pub fn inputs(&self, t: GraphTensor) -> Vec<GraphTensor> {
    self
      .graph
      .edges_directed(t.id, Incoming)
      .sorted_by_key(|e| *e.weight())
      .map(|e| GraphTensor { id: e.source() })
      .collect()
  }

  pub fn variables(&self) -> Vec<GraphTensor> {
    self
      .graph
      .node_indices()
      .filter(|&id| matches!(self.graph[id].op, Op::Variable(_)))
      .map(|id| GraphTensor { id })
      .collect()
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  /// Topologically ordered nodes that `target` depends on, `target` included.
  pub fn evaluation_order(&self, target: GraphTensor) -> Result<Vec<GraphTensor>> {
    self.node(target)?;
    let reversed = Reversed(&self.graph);
    let mut needed = vec![false; self.graph.node_count()];
    let mut dfs = Dfs::new(reversed, target.id);
    while let Some(id) = dfs.next(reversed) {
      needed[id.index()] = true;
    }
    let order = toposort(&self.graph, None)
      .map_err(|cycle| Error::GraphConstruction(format!("cycle at node {:?}", cycle.node_id())))?;
    Ok(
      order
        .into_iter()
        .filter(|id| needed[id.index()])
        .map(|id| GraphTensor { id })
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_tracks_shapes_and_operand_order() {
    let mut g = Graph::new();
    let x = g.placeholder("x", &[3]).unwrap();
    let w = g.variable("w", Tensor::zeros(&[3, 2])).unwrap();
    let b = g.variable("b", Tensor::zeros(&[2])).unwrap();
    let mm = g.matmul(x, w).unwrap();
    let h = g.add(mm, b).unwrap();
    let y = g.sigmoid(h).unwrap();

    assert_eq!(g.shape(y).unwrap(), &[2]);
    assert_eq!(g.inputs(mm), vec![x, w]);
    assert_eq!(g.inputs(h), vec![mm, b]);
    assert_eq!(g.variables(), vec![w, b]);
  }

  #[test]
  fn invalid_dimensions_are_rejected() {
    let mut g = Graph::new();
    assert!(matches!(g.placeholder("x", &[0]), Err(Error::GraphConstruction(_))));
    let x = g.placeholder("x", &[3]).unwrap();
    let w = g.variable("w", Tensor::zeros(&[4, 2])).unwrap();
    assert!(matches!(g.matmul(x, w), Err(Error::GraphConstruction(_))));
    let v = g.variable("v", Tensor::zeros(&[2])).unwrap();
    assert!(g.add(x, v).is_err());
    assert!(g.mean_squared_cost(x, v).is_err());
  }

  #[test]
  fn evaluation_order_skips_unrelated_nodes() {
    let mut g = Graph::new();
    let x = g.placeholder("x", &[2]).unwrap();
    let unrelated = g.placeholder("z", &[2]).unwrap();
    let _other = g.sigmoid(unrelated).unwrap();
    let s = g.sigmoid(x).unwrap();
    let cost = g.mean_squared_cost(x, s).unwrap();

    let order = g.evaluation_order(cost).unwrap();
    assert_eq!(order, vec![x, s, cost]);
  }
}
