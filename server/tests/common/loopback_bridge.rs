use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use server::lobbyv1::LobbyStatus;
use server::pubsub::{StatusBridge, StatusSubscription};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// In-process stand-in for the Redis bridge: one broadcast channel per lobby
/// subject, shared by every "node" holding the same bridge instance.
#[derive(Default)]
pub struct LoopbackBridge {
    channels: Mutex<HashMap<String, broadcast::Sender<LobbyStatus>>>,
    fail_subscribe: AtomicBool,
}

impl LoopbackBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `subscribe` fail, simulating a bridge outage.
    pub fn fail_subscriptions(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    fn sender(&self, lobby_id: &str) -> broadcast::Sender<LobbyStatus> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(lobby_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl StatusBridge for LoopbackBridge {
    async fn publish_status(&self, lobby_id: &str, status: &LobbyStatus) -> Result<()> {
        // No subscribers yet is fine; pub/sub has no delivery guarantee.
        let _ = self.sender(lobby_id).send(status.clone());
        Ok(())
    }

    async fn subscribe(&self, lobby_id: &str) -> Result<StatusSubscription> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            bail!("bridge unavailable");
        }

        let mut rx = self.sender(lobby_id).subscribe();
        let (tx, out) = mpsc::channel(64);
        let token = CancellationToken::new();

        let task_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Ok(status) => {
                            if tx.send(status).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(StatusSubscription::new(out, token))
    }
}
