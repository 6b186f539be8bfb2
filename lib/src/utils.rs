#[cfg(not(debug_assertions))]
use human_panic::setup_panic;
use tracing::subscriber::{DefaultGuard, SetGlobalDefaultError};

#[cfg(debug_assertions)]
extern crate better_panic;

use tracing_subscriber::{fmt, EnvFilter};

// [NOTE] tracing
//
// In code use:
//
// use tracing::{trace, debug, info, warn, error};
//
// and `#[tracing::instrument]` on long-running entry points (loops, servers),
// which opens a span named after the function with its arguments as fields.
// `RUST_LOG` selects the level, e.g. `RUST_LOG=aeviz=debug`.

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn install_logger() -> Result<(), SetGlobalDefaultError> {
  let subscriber = fmt().compact().with_env_filter(env_filter()).finish();
  tracing::subscriber::set_global_default(subscriber)
}

pub fn init_logging() -> Result<(), SetGlobalDefaultError> {
  // Human Panic. Only enabled when *not* debugging.
  #[cfg(not(debug_assertions))]
  {
    setup_panic!();
  }

  // Better Panic. Only enabled *when* debugging.
  #[cfg(debug_assertions)]
  {
    better_panic::Settings::debug()
      .most_recent_first(false)
      .lineno_suffix(true)
      .verbosity(better_panic::Verbosity::Full)
      .install();
  }

  // Setup Logging
  install_logger()?;

  Ok(())
}

/// Logging for tests: scoped to the current thread, dropped with the guard.
pub fn init_logging_tests() -> DefaultGuard {
  let subscriber = fmt()
    .compact()
    .with_test_writer()
    .with_env_filter(env_filter())
    .finish();
  tracing::subscriber::set_default(subscriber)
}
