mod aggregate;
mod config;
mod dispatch;
mod fleet;
mod handlers;
mod provision;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use clap::Parser;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use prism_store::Store;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::fleet::FleetManager;
use crate::handlers::{
    create_session, delete_session, health_check, put_resource, render, AppState,
};
use crate::provision::HttpProvider;

#[derive(Parser, Debug)]
#[command(name = "prism-master")]
#[command(about = "Render farm master: session API, dispatch and fleet control")]
struct Cli {
    /// Listen port (overrides PRISM_MASTER_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    let port = cli.port.unwrap_or(config.port);

    info!("Redis URL: {}", config.redis_url);
    info!("Provisioning API: {}", config.fleet.provision_url);

    let store = match Store::connect(&config.redis_url).await {
        Ok(store) => store,
        Err(err) => {
            error!("failed to connect to redis: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = store.init_session_counter().await {
        error!("failed to initialize session counter: {err}");
        std::process::exit(1);
    }

    let (latency_tx, latency_rx) = mpsc::channel(256);
    let registrations = dispatch::spawn_ack_listener(store.clone(), latency_tx);

    let provider = Arc::new(HttpProvider::new(config.fleet.provision_url.clone()));
    let commands = fleet::spawn_command_poller(store.clone());
    let manager = FleetManager::new(config.fleet.clone(), provider, store.clone());
    tokio::spawn(manager.run(commands, latency_rx));

    let dispatcher = Dispatcher::new(store.clone(), registrations, config.render_timeout);
    let state = AppState { store, dispatcher };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", delete(delete_session))
        .route("/sessions/:id/resources/*name", put(put_resource))
        .route("/sessions/:id/renders", post(render))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("prism master listening on {addr}");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
