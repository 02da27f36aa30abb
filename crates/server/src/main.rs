//! VoiceDock Server
//!
//! Puts realtime voice agents into media channels on request and relays
//! what they say back to the client that asked, over WebSocket.

mod config;
mod credentials;
mod error;
mod logging;
mod orchestrator;
mod registry;
mod relay;
mod state;
mod transport;
mod validation;
mod websocket;
mod worker;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use voicedock_connectors::ProcessWorkerFactory;

use crate::config::Cli;
use crate::credentials::HmacCredentialIssuer;
use crate::orchestrator::Orchestrator;
use crate::state::AppState;
use crate::transport::ConnectionHub;
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logging = logging::init_logging(cli.log_dir.as_deref())?;

    let addr = cli.bind_addr()?;
    let config = cli.orchestrator_config()?;
    let factory = ProcessWorkerFactory::new(cli.worker_command()?, cli.worker_args.clone())
        .with_stop_grace(cli.worker_stop_grace());

    let issuer = match &config.app_cert {
        Some(cert) => Some(HmacCredentialIssuer::new(&config.app_id, cert)?),
        None => None,
    };

    let hub = Arc::new(ConnectionHub::new());
    let orchestrator = Orchestrator::new(config, Arc::new(factory), hub.clone());

    let mut state = AppState::new(orchestrator.clone(), hub)
        .with_stop_on_disconnect(!cli.keep_sessions_on_disconnect);
    if let Some(issuer) = issuer {
        state = state.with_issuer(Arc::new(issuer), cli.token_ttl());
    }

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        bind = %addr,
        credentials = cli.app_cert().is_some(),
        stop_on_disconnect = !cli.keep_sessions_on_disconnect,
        "Starting VoiceDock server"
    );

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .route("/sessions/{channel_name}", get(session_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %listener.local_addr()?,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(
                component = "server",
                event = "server.shutdown_signal",
                "Shutdown requested"
            );
        })
        .await?;

    orchestrator.shutdown().await;
    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}

async fn root_handler() -> impl IntoResponse {
    "Hello, World!"
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.sessions())
}

async fn session_handler(
    State(state): State<AppState>,
    Path(channel_name): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.registry().lookup(&channel_name) {
        Some(summary) => Json(summary).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Current time as unix seconds with a `Z` suffix
pub(crate) fn chrono_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}
