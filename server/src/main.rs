use std::env;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use server::config::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if exists
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env();

    let grpc_port = env::var("LOBBY_GRPC_PORT").unwrap_or_else(|_| "50051".to_string());
    let metrics_port = env::var("LOBBY_METRICS_PORT").unwrap_or_else(|_| "9100".to_string());

    let grpc_addr: SocketAddr = format!("0.0.0.0:{grpc_port}")
        .parse()
        .context("Invalid gRPC listen address")?;
    let metrics_addr: SocketAddr = format!("0.0.0.0:{metrics_port}")
        .parse()
        .context("Invalid metrics listen address")?;

    let cancellation_token = CancellationToken::new();

    let server_token = cancellation_token.clone();
    let server_task = tokio::spawn(async move {
        server::server::run_server(cfg, grpc_addr, metrics_addr, server_token).await
    });

    info!("Server started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal. Shutting down.");
    cancellation_token.cancel();
    server_task.await?
}
