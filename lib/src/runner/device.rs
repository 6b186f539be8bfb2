use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
  error::{Error, Result},
  graph::Session,
};

/// Where device work runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
  /// On the calling task. Blocks its worker thread for the length of the call.
  Inline,
  /// On tokio's blocking pool, the awaiting task is suspended meanwhile.
  #[default]
  Blocking,
}

/// Serializes access to a session. Each `execute` call holds the session for
/// its whole closure, so a training step and an inference pass never interleave.
///
/// Waiting for the session is asynchronous: a caller queued behind a long step
/// only suspends its task.
#[derive(Debug, Clone)]
pub struct Device {
  session: Arc<Mutex<Session>>,
  mode: ExecutionMode,
}

impl Device {
  pub fn new(session: Session, mode: ExecutionMode) -> Self {
    Self {
      session: Arc::new(Mutex::new(session)),
      mode,
    }
  }

  pub fn mode(&self) -> ExecutionMode {
    self.mode
  }

  pub async fn execute<R, F>(&self, f: F) -> Result<R>
  where
    F: FnOnce(&mut Session) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    match self.mode {
      ExecutionMode::Inline => {
        let mut session = self.session.lock().await;
        f(&mut session)
      }
      ExecutionMode::Blocking => {
        let mut session = Arc::clone(&self.session).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut session))
          .await
          .map_err(|e| Error::Device(format!("device task failed: {e}")))?
      }
    }
  }

  /// Holds the session outside of `execute`, stalling every caller meanwhile.
  #[cfg(test)]
  pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Session> {
    self.session.lock().await
  }
}
