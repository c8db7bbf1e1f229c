use log::{error, info, warn};
use std::sync::Arc;

use rusty_comet::config::CometConfig;
use rusty_comet::core::server::Server;
use rusty_comet::handlers::{init_tcp, init_websocket};
use rusty_comet::logic::TokenControlPlane;

#[tokio::main]
async fn main() {
    // Initialize env
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Initialize logging
    env_logger::init();

    // Load config from env
    let config = match CometConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: tcp={:?}, websocket={:?}, buckets={}",
        config.tcp_bind, config.websocket_bind, config.bucket_size
    );

    let server = Arc::new(Server::new(config, Arc::new(TokenControlPlane::new())));
    let _online = server.start_online_task();

    if let Err(e) = init_tcp(Arc::clone(&server)).await {
        error!("Failed to start tcp listeners: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = init_websocket(Arc::clone(&server)).await {
        error!("Failed to start websocket listeners: {}", e);
        std::process::exit(1);
    }

    info!("comet server {} started", server.server_id());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("comet server {} exiting", server.server_id());
}
