//! HTTP/WebSocket surface over the run controller. `api` is the pull
//! transport plus control operations; `ws` is the push transport.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::controller::RunController;
use crate::executor::StageExecutor;
use crate::gate::RiskHistory;

use api::AppState;

pub const DEFAULT_PORT: u16 = 7600;

/// Configuration for the orchestrator server.
pub struct ServerConfig {
    pub port: u16,
    /// Bind on all interfaces and allow permissive CORS.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT, dev_mode: false }
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws/runs/{id}", get(ws::ws_handler))
        .with_state(state)
}

/// Start the orchestrator server and block until shutdown.
pub async fn start_server(
    config: ServerConfig,
    app_config: Config,
    executor: Arc<dyn StageExecutor>,
    history: Arc<dyn RiskHistory>,
) -> Result<()> {
    let controller = Arc::new(RunController::new(executor, history, app_config));
    let state = Arc::new(AppState { controller });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "lockstep server listening");
    println!("Lockstep running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}
