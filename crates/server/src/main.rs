//! Platewise Server
//!
//! Nutrition coaching over WebSocket. Each identity gets one session actor
//! that owns its connection, its stored records and its scheduled reminders.

mod alarm;
mod api;
mod command;
mod config;
mod connection;
mod conversation;
mod db;
mod generation;
mod handlers;
mod logging;
mod migration_runner;
mod nutrition;
mod paths;
mod profile;
mod reminders;
mod scheduler;
mod session_actor;
mod session_command;
mod state;
mod store;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Cli;
use crate::db::Db;
use crate::handlers::HandlerChain;
use crate::nutrition::KeywordScorer;
use crate::session_actor::ActorDeps;
use crate::state::SessionRegistry;
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs()?;
    let logging = logging::init_logging()?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %data_dir.display(),
        bind = %cli.bind,
        streaming = cli.stream_responses,
        model = %cli.model,
        actor_idle_secs = cli.actor_idle_secs,
        "Starting Platewise server"
    );

    let db = Db::open(&paths::db_path())?;
    let generation_config = cli.generation();
    let registry = Arc::new(SessionRegistry::new(ActorDeps {
        db,
        generator: generation::from_config(&generation_config),
        scorer: Arc::new(KeywordScorer),
        chain: Arc::new(HandlerChain::standard()),
        streaming: cli.stream_responses,
    }));
    registry.rehydrate().await?;
    let reaper = registry.spawn_reaper(Duration::from_secs(cli.actor_idle_secs));

    let app = build_router(Arc::clone(&registry));
    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %cli.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    reaper.abort();

    info!(
        component = "server",
        event = "server.stopped",
        actors = registry.len(),
        "Server stopped"
    );
    Ok(())
}

pub(crate) fn build_router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(registry)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Failed to listen for ctrl-c"
        );
        std::future::pending::<()>().await;
    }
    info!(
        component = "server",
        event = "server.shutdown_requested",
        "Shutdown requested"
    );
}
