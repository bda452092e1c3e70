mod config;
mod executor;
mod renderer;
mod sandbox;

use clap::Parser;
use tracing::{error, info, warn};

use prism_proto::FleetCommand;
use prism_store::Store;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "prism-worker")]
#[command(about = "Render farm worker: executes render jobs from the shared queue")]
struct Cli {}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let _cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    info!(worker = %config.worker_name, "starting prism worker");

    let store = match Store::connect(&config.redis_url).await {
        Ok(store) => store,
        Err(err) => {
            error!("failed to connect to redis: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = tokio::fs::create_dir_all(sandbox::cache_dir(&config.work_dir)).await {
        error!("failed to create work directory: {err}");
        std::process::exit(1);
    }

    tokio::spawn(ping_loop(
        store.clone(),
        config.worker_name.clone(),
        config.ping_interval,
    ));
    tokio::spawn(sandbox::sweep_cache_loop(
        store.clone(),
        config.work_dir.clone(),
        config.cache_sweep_interval,
    ));

    let exit_code = executor::run(store, config).await;
    std::process::exit(exit_code);
}

/// Tell the fleet manager we are alive, forever.
async fn ping_loop(store: Store, worker_name: String, interval: std::time::Duration) {
    let token = FleetCommand::Ping {
        worker: worker_name,
    }
    .token();
    let mut timer = tokio::time::interval(interval);
    loop {
        timer.tick().await;
        if let Err(err) = store.push_master_command(&token).await {
            warn!(%err, "failed to push ping");
        }
    }
}
