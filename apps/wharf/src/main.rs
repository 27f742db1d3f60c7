mod agent;
mod broker;
mod cli;
mod config;
mod error;
mod protocol;
mod registry;
mod routes;

use std::net::SocketAddr;

use clap::Parser;
use tracing::{error, info};

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::routes::{build_router, AppState};

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Check if running as the terminal debug client
    if let Some(Commands::Attach { url, token }) = cli.command {
        if let Err(e) = cli::run_attach_client(url, token).await {
            error!("attach client error: {e}");
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as the control plane server
    let config = Config::from_env();
    info!("starting wharf control plane on port {}", config.port);
    info!(
        "provider ttl: {:?}, session idle ttl: {:?}",
        config.provider_ttl, config.session_idle_ttl
    );

    let state = AppState::new(config.clone());

    // Background expiry: provider liveness sweep and idle-session reaper run
    // on their own timers, decoupled from any request path.
    state
        .registry
        .clone()
        .spawn_sweeper(config.provider_ttl, config.sweep_interval);
    state.broker.clone().spawn_reaper(config.session_reap_interval);

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("wharf listening on {addr}");

    // ConnectInfo carries the observed peer address into the heartbeat path.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("failed to start server");
}
