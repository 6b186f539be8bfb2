//! The fixed MNIST autoencoder topology.

use rand::Rng;
use tracing::debug;

use crate::{
  error::{Error, Result},
  graph::{ConstantInitializer, Graph, GraphTensor, Initializer, RandomNormalInitializer},
};

pub const IMAGE_SIZE: usize = 28;
pub const INPUT_VECTOR_LENGTH: usize = IMAGE_SIZE * IMAGE_SIZE;
/// Encoder widths. The decoder mirrors them back up to the input length.
pub const HIDDEN_LAYERS: [usize; 2] = [256, 128];

const WEIGHT_STDEV: f32 = 0.1;
const BIAS_INIT: f32 = 0.001;

/// Handles into an autoencoder graph.
#[derive(Debug)]
pub struct Autoencoder {
  pub graph: Graph,
  pub input: GraphTensor,
  pub output: GraphTensor,
  pub cost: GraphTensor,
}

/// `sigmoid(x . W + b)` with a fresh `[in, out]` weight matrix and `[out]` bias.
fn dense_sigmoid<R: Rng + ?Sized>(
  graph: &mut Graph,
  name: &str,
  x: GraphTensor,
  units: usize,
  weights: &RandomNormalInitializer,
  biases: &ConstantInitializer,
  rng: &mut R,
) -> Result<GraphTensor> {
  let inputs = match graph.shape(x)? {
    [n] => *n,
    other => {
      return Err(Error::GraphConstruction(format!(
        "{name} expects a vector input, got {other:?}"
      )))
    }
  };
  let w = graph.variable(&format!("{name}/weights"), weights.initialize(&[inputs, units], rng))?;
  let b = graph.variable(&format!("{name}/biases"), biases.initialize(&[units], rng))?;
  let xw = graph.matmul(x, w)?;
  let affine = graph.add(xw, b)?;
  graph.sigmoid(affine)
}

/// Builds `input_len -> 256 -> 128 -> 256 -> input_len` with a sigmoid after
/// every layer and a mean squared error between reconstruction and input.
pub fn build_autoencoder<R: Rng + ?Sized>(input_len: usize, rng: &mut R) -> Result<Autoencoder> {
  if input_len == 0 {
    return Err(Error::GraphConstruction("autoencoder input length must be positive".into()));
  }
  let weights = RandomNormalInitializer::new(0.0, WEIGHT_STDEV)?;
  let biases = ConstantInitializer::new(BIAS_INIT);

  let mut graph = Graph::new();
  let input = graph.placeholder("input", &[input_len])?;

  let [h1, h2] = HIDDEN_LAYERS;
  let layers = [("encode1", h1), ("encode2", h2), ("decode1", h1), ("decode2", input_len)];
  let mut x = input;
  for (name, units) in layers {
    x = dense_sigmoid(&mut graph, name, x, units, &weights, &biases, rng)?;
  }
  let output = x;
  let cost = graph.mean_squared_cost(input, output)?;
  debug!(nodes = graph.node_count(), "built autoencoder graph");

  Ok(Autoencoder {
    graph,
    input,
    output,
    cost,
  })
}
