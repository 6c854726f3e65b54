use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{RwLock, mpsc};
use tonic::Status;
use tracing::{debug, warn};

use crate::lobbyv1::{LobbyStatus, Status as StatusCode};
use crate::metrics;
use crate::pubsub::StatusBridge;

pub type StatusSink = mpsc::Sender<Result<LobbyStatus, Status>>;

type SinkMap = Arc<RwLock<HashMap<String, HashMap<String, StatusSink>>>>;

pub fn is_terminal(status: &LobbyStatus) -> bool {
    matches!(
        StatusCode::try_from(status.status),
        Ok(StatusCode::Starting | StatusCode::Timeout | StatusCode::Error)
    )
}

/// Directory of live subscriber sinks, keyed by lobby and player.
///
/// The `local` cohort is fed directly by this node's waiters; the `remote`
/// cohort is fed by bridge subscriptions relaying frames published on other
/// nodes. Sinks are only borrowed: the registry never keeps a stream alive,
/// it evicts entries when the sink observably closes.
pub struct StreamManager {
    local: SinkMap,
    remote: SinkMap,
    bridge: Arc<dyn StatusBridge>,
}

impl StreamManager {
    pub fn new(bridge: Arc<dyn StatusBridge>) -> Arc<Self> {
        Arc::new(Self {
            local: Arc::new(RwLock::new(HashMap::new())),
            remote: Arc::new(RwLock::new(HashMap::new())),
            bridge,
        })
    }

    /// Registers a sink fed by this node's waiter. A watcher task evicts the
    /// entry once the client side goes away.
    pub async fn register_local(&self, lobby_id: &str, player_id: &str, sink: StatusSink) {
        {
            let mut local = self.local.write().await;
            local
                .entry(lobby_id.to_string())
                .or_default()
                .insert(player_id.to_string(), sink.clone());
        }
        metrics::ACTIVE_STREAMS.inc();

        let local = Arc::clone(&self.local);
        let lobby_id = lobby_id.to_string();
        let player_id = player_id.to_string();
        tokio::spawn(async move {
            sink.closed().await;
            remove_sink(&local, &lobby_id, &player_id).await;
        });
    }

    /// Registers a sink for a lobby whose waiter runs on another node and
    /// relays the lobby's bridge frames into it. The relay stops on sink
    /// closure or on a terminal frame, unsubscribing either way.
    pub async fn register_remote(
        &self,
        lobby_id: &str,
        player_id: &str,
        sink: StatusSink,
    ) -> Result<()> {
        let mut subscription = self.bridge.subscribe(lobby_id).await?;

        {
            let mut remote = self.remote.write().await;
            remote
                .entry(lobby_id.to_string())
                .or_default()
                .insert(player_id.to_string(), sink.clone());
        }
        metrics::ACTIVE_STREAMS.inc();

        let remote = Arc::clone(&self.remote);
        let lobby_id = lobby_id.to_string();
        let player_id = player_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sink.closed() => break,
                    frame = subscription.recv() => {
                        let Some(frame) = frame else { break };
                        let terminal = is_terminal(&frame);
                        if sink.send(Ok(frame)).await.is_err() {
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                }
            }
            remove_sink(&remote, &lobby_id, &player_id).await;
        });

        Ok(())
    }

    /// Sends a status frame to every local subscriber of the lobby. Dead
    /// sinks are evicted; a terminal frame closes the whole cohort so the
    /// response streams end.
    pub async fn broadcast_lobby_update(&self, lobby_id: &str, status: &LobbyStatus) {
        let targets: Vec<(String, StatusSink)> = {
            let local = self.local.read().await;
            match local.get(lobby_id) {
                Some(sinks) => sinks.iter().map(|(id, s)| (id.clone(), s.clone())).collect(),
                None => Vec::new(),
            }
        };

        let mut dead: Vec<String> = Vec::new();
        for (player_id, sink) in targets {
            if sink.send(Ok(status.clone())).await.is_err() {
                dead.push(player_id);
            }
        }

        if is_terminal(status) {
            let mut local = self.local.write().await;
            if let Some(sinks) = local.remove(lobby_id) {
                metrics::ACTIVE_STREAMS.sub(sinks.len() as i64);
                debug!(lobby_id, subscribers = sinks.len(), "Closed lobby stream cohort");
            }
        } else if !dead.is_empty() {
            let mut local = self.local.write().await;
            if let Some(sinks) = local.get_mut(lobby_id) {
                for player_id in &dead {
                    if sinks.remove(player_id).is_some() {
                        metrics::ACTIVE_STREAMS.dec();
                    }
                }
                if sinks.is_empty() {
                    local.remove(lobby_id);
                }
            }
            warn!(lobby_id, dropped = dead.len(), "Evicted dead lobby subscribers");
        }
    }

    /// Publishes the frame for subscribers attached through other nodes.
    pub async fn publish_lobby_status(&self, lobby_id: &str, status: &LobbyStatus) -> Result<()> {
        self.bridge.publish_status(lobby_id, status).await
    }

    pub async fn local_subscribers(&self, lobby_id: &str) -> usize {
        self.local
            .read()
            .await
            .get(lobby_id)
            .map_or(0, |sinks| sinks.len())
    }

    pub async fn remote_subscribers(&self, lobby_id: &str) -> usize {
        self.remote
            .read()
            .await
            .get(lobby_id)
            .map_or(0, |sinks| sinks.len())
    }
}

async fn remove_sink(map: &SinkMap, lobby_id: &str, player_id: &str) {
    let mut map = map.write().await;
    if let Some(sinks) = map.get_mut(lobby_id) {
        if sinks.remove(player_id).is_some() {
            metrics::ACTIVE_STREAMS.dec();
        }
        if sinks.is_empty() {
            map.remove(lobby_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_close_streams() {
        let frame = |code: StatusCode| LobbyStatus {
            status: code as i32,
            ..Default::default()
        };

        assert!(!is_terminal(&frame(StatusCode::Unspecified)));
        assert!(!is_terminal(&frame(StatusCode::Waiting)));
        assert!(is_terminal(&frame(StatusCode::Starting)));
        assert!(is_terminal(&frame(StatusCode::Timeout)));
        assert!(is_terminal(&frame(StatusCode::Error)));
    }
}
