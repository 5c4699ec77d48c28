//! HTTP server setup: router and health routes.

use super::state::ApiState;
use crate::presence::PresenceAction;
use crate::supervisor::SupervisorState;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;

// -- Response types --

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    running_bots: usize,
    total_bots: usize,
    active_tickers: usize,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    pid: u32,
    uptime_seconds: u64,
    bots: Vec<BotStatus>,
}

#[derive(Debug, Serialize)]
struct BotStatus {
    id: String,
    action: PresenceAction,
    state: SupervisorState,
    active_tickers: usize,
}

/// Start the HTTP server on the given address.
///
/// Returns the join handle of the server task. The server stops once
/// `shutdown_rx` turns true.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}

// -- API handlers --

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let running_bots = state.running_bots();
    Json(HealthResponse {
        status: if running_bots > 0 { "ok" } else { "starting" },
        running_bots,
        total_bots: state.bots.len(),
        active_tickers: state.active_tickers().await,
    })
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let uptime = state.started_at.elapsed();

    let mut bots = Vec::with_capacity(state.bots.len());
    for bot in &state.bots {
        bots.push(BotStatus {
            id: bot.bot_id().to_string(),
            action: bot.action(),
            state: bot.state(),
            active_tickers: bot.active_tickers().await,
        });
    }

    Json(StatusResponse {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
        uptime_seconds: uptime.as_secs(),
        bots,
    })
}
