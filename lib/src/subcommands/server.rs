use std::sync::Arc;

use axum::{
  extract::{Query, State},
  response::Html,
  routing::get,
  Json, Router,
};
use serde::Deserialize;
use tokio::{
  net::TcpListener,
  sync::{watch, RwLock},
};
use tracing::info;

use crate::{
  error::{Error, Result},
  viz::{Dashboard, DashboardSnapshot},
};

const PAGE: &str = include_str!("page.html");

type SharedDashboard = Arc<RwLock<Dashboard>>;

#[derive(Debug, Default, Deserialize)]
struct StateQuery {
  /// Cost points the page already has.
  #[serde(default)]
  chart_from: usize,
}

/// Serves the dashboard page and its state.
pub struct Server {
  port: u16,
  dashboard: SharedDashboard,
}

impl Server {
  pub fn new(port: u16, dashboard: SharedDashboard) -> Self {
    Self { port, dashboard }
  }

  pub fn router(&self) -> Router {
    Router::new()
      .route("/", get(Self::handle_page))
      .route("/api/state", get(Self::handle_state))
      .with_state(Arc::clone(&self.dashboard))
  }

  /// Binds `0.0.0.0:port` and serves until `shutdown` flips.
  #[tracing::instrument(skip_all, fields(port = self.port))]
  pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
    let server_addr = format!("0.0.0.0:{}", self.port);
    let tcp_listener = TcpListener::bind(&server_addr)
      .await
      .map_err(|e| Error::Server(format!("cannot bind {server_addr}: {e}")))?;
    info!("dashboard at http://localhost:{}/", self.port);
    self.serve_on(tcp_listener, shutdown).await
  }

  pub async fn serve_on(self, tcp_listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = self.router();
    axum::serve(tcp_listener, app)
      .with_graceful_shutdown(async move {
        // a dropped sender counts as shutdown too
        let _ = shutdown.wait_for(|stop| *stop).await;
      })
      .await
      .map_err(|e| Error::Server(e.to_string()))?;
    info!("dashboard stopped");
    Ok(())
  }

  async fn handle_page() -> Html<&'static str> {
    Html(PAGE)
  }

  async fn handle_state(
    State(dashboard): State<SharedDashboard>,
    Query(query): Query<StateQuery>,
  ) -> Json<DashboardSnapshot> {
    Json(dashboard.read().await.snapshot(query.chart_from))
  }
}
