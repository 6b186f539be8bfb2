use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::{
  config::RunConfig,
  error::{Error, Result},
  viz::{run_dashboard, Dashboard},
};

use super::{
  pipeline::{shutdown_on_ctrl_c, supervise, Pipeline},
  Server,
};

/// Trains, samples and serves the live dashboard until Ctrl-C or a failure.
pub struct Serve {
  port: u16,
  config: RunConfig,
}

/// Side of the square image a flat vector of `len` pixels came from.
fn image_side(len: usize) -> Result<usize> {
  let side = (len as f64).sqrt().round() as usize;
  if side * side != len {
    return Err(Error::Config(format!("{len} pixels do not form a square image")));
  }
  Ok(side)
}

impl Serve {
  pub fn new(port: u16, config: RunConfig) -> Self {
    Self { port, config }
  }

  pub async fn run(self) -> Result<()> {
    let (shutdown, _) = shutdown_on_ctrl_c();
    self.run_until(shutdown).await
  }

  #[tracing::instrument(skip_all, fields(port = self.port))]
  pub async fn run_until(self, shutdown: Arc<watch::Sender<bool>>) -> Result<()> {
    let Pipeline {
      runner,
      events,
      normalization,
      input_len,
      training,
      inference,
    } = Pipeline::prepare(&self.config).await?;

    let side = image_side(input_len)?;
    let dashboard = Dashboard::new(self.config.inference_example_count, side, normalization);
    let dashboard = Arc::new(RwLock::new(dashboard));

    let pump = tokio::spawn(run_dashboard(Arc::clone(&dashboard), events));
    let server = tokio::spawn(Server::new(self.port, dashboard).run(shutdown.subscribe()));
    let training = training.spawn(&runner, shutdown.subscribe());
    let inference = inference.spawn(&runner, shutdown.subscribe());
    // the pump ends once the loops drop their event senders
    drop(runner);

    let (trained, sampled, served, pumped) = tokio::join!(
      supervise("training", training, &shutdown),
      supervise("inference", inference, &shutdown),
      supervise("server", server, &shutdown),
      supervise("dashboard", pump, &shutdown),
    );
    let trained = trained?;
    let sampled = sampled?;
    served?;
    pumped?;
    info!(trained, sampled, "session finished");
    Ok(())
  }
}
