use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::lobbyv1::LobbyStatus;
use crate::redis_keys::RedisKeys;

/// Node-to-node status fan-out on `lobby.updates.<lobbyID>`. Best-effort:
/// frames are state snapshots, so losses and reorders are tolerated by
/// consumers.
#[async_trait]
pub trait StatusBridge: Send + Sync {
    async fn publish_status(&self, lobby_id: &str, status: &LobbyStatus) -> Result<()>;

    /// Starts relaying the lobby's frames. Dropping the subscription stops
    /// the relay and unsubscribes.
    async fn subscribe(&self, lobby_id: &str) -> Result<StatusSubscription>;
}

pub struct StatusSubscription {
    receiver: mpsc::Receiver<LobbyStatus>,
    token: CancellationToken,
}

impl StatusSubscription {
    pub fn new(receiver: mpsc::Receiver<LobbyStatus>, token: CancellationToken) -> Self {
        Self { receiver, token }
    }

    pub async fn recv(&mut self) -> Option<LobbyStatus> {
        self.receiver.recv().await
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Redis pub/sub bridge. Publishes on the shared connection manager; every
/// subscription runs its own pub/sub connection in a background task, the
/// same way partition subscriptions are handled elsewhere in the stack.
pub struct RedisBridge {
    conn: ConnectionManager,
    redis_url: String,
}

impl RedisBridge {
    pub fn new(conn: ConnectionManager, redis_url: impl Into<String>) -> Self {
        Self {
            conn,
            redis_url: redis_url.into(),
        }
    }
}

#[async_trait]
impl StatusBridge for RedisBridge {
    async fn publish_status(&self, lobby_id: &str, status: &LobbyStatus) -> Result<()> {
        let channel = RedisKeys::lobby_updates_channel(lobby_id);
        let data = serde_json::to_vec(status).context("Failed to serialize lobby status")?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(&channel, data)
            .await
            .context("Failed to publish lobby status")?;

        debug!(lobby_id, status = status.status, "Published lobby status");
        Ok(())
    }

    async fn subscribe(&self, lobby_id: &str) -> Result<StatusSubscription> {
        let channel = RedisKeys::lobby_updates_channel(lobby_id);
        let (tx, rx) = mpsc::channel(64);
        let token = CancellationToken::new();

        let redis_url = self.redis_url.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_lobby_subscription(redis_url, channel, tx, task_token).await {
                error!(error = %err, "Lobby subscription handler failed");
            }
        });

        Ok(StatusSubscription::new(rx, token))
    }
}

async fn handle_lobby_subscription(
    redis_url: String,
    channel: String,
    tx: mpsc::Sender<LobbyStatus>,
    token: CancellationToken,
) -> Result<()> {
    let client = Client::open(redis_url.as_str())
        .context("Failed to create Redis client for subscription")?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("Failed to create pub/sub connection")?;

    pubsub
        .subscribe(&channel)
        .await
        .context("Failed to subscribe to lobby channel")?;

    debug!(%channel, "Subscribed to lobby updates");

    {
        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = stream.next() => {
                    let Some(msg) = msg else { break };
                    let payload: Vec<u8> = msg
                        .get_payload()
                        .context("Failed to read status payload")?;

                    match serde_json::from_slice::<LobbyStatus>(&payload) {
                        Ok(status) => {
                            if tx.send(status).await.is_err() {
                                debug!(%channel, "Status receiver dropped, stopping subscription");
                                break;
                            }
                        }
                        Err(err) => {
                            error!(%channel, error = %err, "Failed to deserialize lobby status");
                        }
                    }
                }
            }
        }
    }

    if let Err(err) = pubsub.unsubscribe(&channel).await {
        warn!(%channel, error = %err, "Failed to unsubscribe from lobby channel");
    }

    Ok(())
}
