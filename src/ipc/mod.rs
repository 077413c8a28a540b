pub mod handlers;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::manager::Manager;
use handlers::{mcp, server};

/// Body of `POST /api/servers/:name/invoke`
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeRequest {
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
    pub timeout_ms: Option<u64>,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub manager: Arc<Manager>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(manager: Arc<Manager>, listen_addr: &str) -> Self {
        Self {
            manager,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/servers", get(server::list_servers))
            .route("/api/servers/:name", get(server::get_server))
            .route("/api/servers/:name/invoke", post(server::invoke))
            .route("/api/servers/:name/restart", post(server::restart))
            .route("/api/servers/:name/warm-up", post(server::warm_up))
            .route("/api/servers/:name/refresh", post(server::refresh))
            .route("/api/servers/:name/logs", get(server::logs))
            .route("/api/health-check", get(server::health_check))
            .route("/api/reload", post(server::reload))
            .route("/api/configurations", get(server::configurations))
            .route("/mcp/:name", post(mcp::passthrough))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests.
    pub async fn start_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
