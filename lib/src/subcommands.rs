pub use serve::*;
pub use server::*;
pub use train::*;

pub mod pipeline;
pub mod serve;
pub mod server;
pub mod train;
