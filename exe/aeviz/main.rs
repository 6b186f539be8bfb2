mod app_config;

use aeviz::{subcommands, utils};

use app_config::AppConfig;
use clap::{Args, Parser, Subcommand};
use std::{error::Error, path::PathBuf};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
  /// YAML file with run settings. Flags given on the command line take precedence.
  #[arg(short, long, global = true, value_name = "PATH")]
  config: Option<PathBuf>,
  #[command(subcommand)]
  command: Command,
}

#[derive(Args)]
struct RunArgs {
  /// Path or URL of the dataset config JSON
  #[arg(long, value_name = "PATH")]
  dataset_config: Option<String>,
  #[arg(long, value_name = "NAME")]
  dataset: Option<String>,
  #[arg(short, long, value_name = "INT")]
  batch_size: Option<usize>,
  /// Stop training after this many batches
  #[arg(long, value_name = "INT")]
  batches: Option<u64>,
  #[arg(long, value_name = "INT")]
  seed: Option<u64>,
}

impl From<RunArgs> for AppConfig {
  fn from(args: RunArgs) -> Self {
    Self {
      dataset_config: args.dataset_config,
      dataset_name: args.dataset,
      batch_size: args.batch_size,
      max_batches: args.batches,
      seed: args.seed,
      ..AppConfig::default()
    }
  }
}

#[derive(Subcommand)]
enum Command {
  /// Train the autoencoder and serve the live dashboard
  Serve {
    #[arg(short, long)]
    port: Option<u16>,
    #[command(flatten)]
    run: RunArgs,
  },
  /// Train without a dashboard, logging progress
  Train {
    #[command(flatten)]
    run: RunArgs,
  },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  utils::init_logging()?;
  let args = Cli::parse();
  let file_config = match &args.config {
    Some(path) => AppConfig::from_file(path)?,
    None => AppConfig::default(),
  };

  match args.command {
    Command::Serve { port, run } => {
      let config = file_config.merge(AppConfig {
        port,
        ..AppConfig::from(run)
      });
      let app = subcommands::Serve::new(config.port(), config.run_config());
      app.run().await?;
    }
    Command::Train { run } => {
      let config = file_config.merge(AppConfig::from(run));
      let app = subcommands::Train::new(config.run_config());
      app.run().await?;
    }
  }
  Ok(())
}
