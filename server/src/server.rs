use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};

use crate::config::Config;
use crate::handler::LobbyHandler;
use crate::lobbyv1::lobby_service_server::LobbyServiceServer;
use crate::matcher::Matcher;
use crate::metrics;
use crate::pubsub::RedisBridge;
use crate::redis_utils::create_connection_manager;
use crate::score::ScoreProviders;
use crate::store::{LobbyStore, RedisStore};
use crate::streamer::StreamManager;
use crate::waiter::Waiter;

/// Pushes a configuration snapshot to every reloadable component. Floors
/// still apply when the values are read.
pub fn apply_config(cfg: &Config, handler: &LobbyHandler, waiter: &Waiter, matcher: &Matcher) {
    handler.update_config(cfg.handler.clone());
    waiter.update_config(cfg.lobby.clone());
    matcher.update_config(cfg.matcher.clone());
}

/// Wires the store, bridge, registries and handler together and serves the
/// gRPC endpoint plus the Prometheus listener until the token fires.
/// SIGHUP re-reads the environment and pushes the new tunables to the
/// running components.
pub async fn run_server(
    cfg: Config,
    grpc_addr: SocketAddr,
    metrics_addr: SocketAddr,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let client =
        redis::Client::open(cfg.redis.url.as_str()).context("Failed to create Redis client")?;
    let conn = create_connection_manager(client).await?;

    let scores = Arc::new(ScoreProviders::new());
    let store: Arc<dyn LobbyStore> = Arc::new(RedisStore::new(conn.clone(), scores));
    let bridge = Arc::new(RedisBridge::new(conn, cfg.redis.url.clone()));

    let streamer = StreamManager::new(bridge);
    let matcher = Arc::new(Matcher::new(cfg.matcher.clone()));
    let waiter = Arc::new(Waiter::new(
        store.clone(),
        streamer.clone(),
        cfg.lobby.clone(),
    ));
    let handler = Arc::new(LobbyHandler::new(
        store,
        streamer,
        matcher.clone(),
        waiter.clone(),
        cfg.handler.clone(),
        cancellation_token.clone(),
    ));

    tokio::spawn(reload_on_sighup(
        handler.clone(),
        waiter,
        matcher,
        cancellation_token.clone(),
    ));

    let grpc_token = cancellation_token.clone();
    let grpc_server = Server::builder()
        .add_service(LobbyServiceServer::from_arc(handler))
        .serve_with_shutdown(grpc_addr, async move { grpc_token.cancelled().await });

    let metrics_app = Router::new().route("/metrics", get(|| async { metrics::render() }));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .context("Failed to bind metrics listener")?;
    let metrics_token = cancellation_token.clone();
    let metrics_server = axum::serve(metrics_listener, metrics_app)
        .with_graceful_shutdown(async move { metrics_token.cancelled().await });

    info!(%grpc_addr, %metrics_addr, "Lobby service listening");

    tokio::try_join!(
        async { grpc_server.await.context("gRPC server failed") },
        async { metrics_server.await.context("Metrics server failed") },
    )?;

    info!("Lobby service shut down gracefully");
    Ok(())
}

#[cfg(unix)]
async fn reload_on_sighup(
    handler: Arc<LobbyHandler>,
    waiter: Arc<Waiter>,
    matcher: Arc<Matcher>,
    token: CancellationToken,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "Failed to install SIGHUP handler, runtime reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = hangups.recv() => {
                if received.is_none() {
                    break;
                }

                let cfg = Config::from_env();
                apply_config(&cfg, &handler, &waiter, &matcher);
                info!("Configuration reloaded");
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_sighup(
    _handler: Arc<LobbyHandler>,
    _waiter: Arc<Waiter>,
    _matcher: Arc<Matcher>,
    token: CancellationToken,
) {
    token.cancelled().await;
}
