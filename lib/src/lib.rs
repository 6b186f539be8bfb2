pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod model;
pub mod runner;
pub mod subcommands;
pub mod tensor;
pub mod utils;
pub mod viz;

pub use config::RunConfig;
pub use error::{Error, Result};
pub use tensor::Tensor;
