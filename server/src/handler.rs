use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use common::{Lobby, Player};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::config::HandlerConfig;
use crate::lobbyv1::lobby_service_server::LobbyService;
use crate::lobbyv1::{JoinLobbyRequest, LobbyStatus, Status as StatusCode};
use crate::matcher::Matcher;
use crate::metrics;
use crate::store::{LobbyStore, StoreError};
use crate::streamer::StreamManager;
use crate::waiter::Waiter;

const LOBBY_ID_LEN: usize = 12;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Short collision-resistant lobby id; 12 alphanumeric chars give 62^12
/// values, so fresh ids need no existence check.
pub fn generate_lobby_id() -> String {
    let mut rng = rand::thread_rng();
    (0..LOBBY_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ID_ALPHABET.len());
            ID_ALPHABET[idx] as char
        })
        .collect()
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<LobbyStatus, Status>> + Send>>;

/// Entry point for a player's JoinLobby stream: discovery, attach or
/// creation, and binding the stream to the registry.
pub struct LobbyHandler {
    store: Arc<dyn LobbyStore>,
    streamer: Arc<StreamManager>,
    matcher: Arc<Matcher>,
    waiter: Arc<Waiter>,
    config: RwLock<HandlerConfig>,
    shutdown: CancellationToken,
}

impl LobbyHandler {
    pub fn new(
        store: Arc<dyn LobbyStore>,
        streamer: Arc<StreamManager>,
        matcher: Arc<Matcher>,
        waiter: Arc<Waiter>,
        cfg: HandlerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            streamer,
            matcher,
            waiter,
            config: RwLock::new(cfg),
            shutdown,
        }
    }

    pub fn update_config(&self, new_cfg: HandlerConfig) {
        *self.config.write().unwrap() = new_cfg;
    }

    fn config(&self) -> HandlerConfig {
        self.config.read().unwrap().clone()
    }

    /// Tries to place the player into one of the best open lobbies. Lobbies
    /// that refuse the insert (full, vanished, lock contention) are excluded
    /// and the next candidate is tried, up to the attempt budget.
    async fn try_join_existing(
        &self,
        player: &Player,
        mode: &str,
        cfg: &HandlerConfig,
    ) -> Option<Lobby> {
        let top = match self
            .store
            .get_top_lobbies(mode, cfg.top_lobbies_limit())
            .await
        {
            Ok(top) => top,
            Err(err) => {
                warn!(mode, error = %err, "Failed to fetch open lobbies, creating instead");
                return None;
            }
        };

        let mut excluded: HashSet<String> = HashSet::new();

        for _ in 0..cfg.max_lobby_attempts() {
            let candidates = top.iter().filter(|l| !excluded.contains(&l.id));
            let best = self.matcher.select_best(mode, candidates, player)?;

            match self.store.add_player(&best.id, player.clone()).await {
                Ok(updated) => return Some(updated),
                Err(err @ (StoreError::Full | StoreError::NotFound | StoreError::LockTimeout)) => {
                    debug!(lobby_id = %best.id, error = %err, "Lobby refused insert, excluding");
                    excluded.insert(best.id.clone());
                }
                Err(err) => {
                    warn!(lobby_id = %best.id, error = %err, "Insert failed, excluding lobby");
                    excluded.insert(best.id.clone());
                }
            }
        }

        None
    }

    async fn create_lobby(
        &self,
        player: Player,
        mode: &str,
        cfg: &HandlerConfig,
    ) -> Result<Lobby, StoreError> {
        let stats = cfg.mode_stats(mode);
        let now = Utc::now();

        let mut lobby = Lobby::new(
            generate_lobby_id(),
            mode,
            stats.min,
            stats.max,
            now,
            now + cfg.lobby_ttl(),
        );

        if lobby.add_player(player).is_err() {
            return Err(StoreError::Full);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.add_lobby(&lobby).await {
                Ok(()) => return Ok(lobby),
                Err(err) if attempt < cfg.max_lobby_attempts() => {
                    warn!(
                        lobby_id = %lobby.id,
                        attempt,
                        error = %err,
                        "Failed to persist new lobby, retrying"
                    );
                    sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn spawn_waiter(&self, lobby: Lobby, cfg: &HandlerConfig) {
        let waiter = self.waiter.clone();
        let token = self.shutdown.child_token();

        // Hard lifetime cap: the waiter normally ends itself on a terminal
        // state well before this; the grace period lets the expiry tick land.
        let deadline = cfg.lobby_ttl() + Duration::from_secs(5);

        tokio::spawn(async move {
            tokio::select! {
                _ = waiter.wait_for_lobby_fill(token, lobby) => {}
                _ = sleep(deadline) => {}
            }
        });
    }
}

#[tonic::async_trait]
impl LobbyService for LobbyHandler {
    type JoinLobbyStream = ResponseStream;

    async fn join_lobby(
        &self,
        request: Request<JoinLobbyRequest>,
    ) -> Result<Response<Self::JoinLobbyStream>, Status> {
        let req = request.into_inner();

        if req.player_id.is_empty() {
            return Err(Status::invalid_argument("player_id is required"));
        }
        if req.mode.is_empty() {
            return Err(Status::invalid_argument("mode is required"));
        }

        let player = Player::new(req.player_id.clone(), req.rating, req.category_ids.clone());
        let cfg = self.config();
        let (tx, rx) = mpsc::channel::<Result<LobbyStatus, Status>>(32);

        if let Some(joined) = self.try_join_existing(&player, &req.mode, &cfg).await {
            info!(
                player_id = %req.player_id,
                lobby_id = %joined.id,
                mode = %req.mode,
                players = joined.player_count(),
                "Player matched to existing lobby"
            );

            metrics::LOBBY_PLAYERS_COUNT
                .with_label_values(&[&joined.id, &joined.mode])
                .set(joined.player_count() as i64);

            // The waiter for this lobby runs on its creating node; without
            // the bridge subscription this stream has no frame source, so
            // the join fails with a single ERROR frame.
            if let Err(err) = self
                .streamer
                .register_remote(&joined.id, &req.player_id, tx.clone())
                .await
            {
                error!(
                    lobby_id = %joined.id,
                    player_id = %req.player_id,
                    error = %err,
                    "Failed to subscribe to lobby updates"
                );

                let status = LobbyStatus {
                    lobby_id: joined.id.clone(),
                    status: StatusCode::Error as i32,
                    ..Default::default()
                };
                let _ = tx.send(Ok(status)).await;
            }

            return Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::JoinLobbyStream));
        }

        match self.create_lobby(player, &req.mode, &cfg).await {
            Ok(lobby) => {
                info!(
                    player_id = %req.player_id,
                    lobby_id = %lobby.id,
                    mode = %req.mode,
                    min_players = lobby.min_players,
                    max_players = lobby.max_players,
                    "Created new lobby"
                );

                metrics::LOBBY_PLAYERS_COUNT
                    .with_label_values(&[&lobby.id, &lobby.mode])
                    .set(1);

                self.spawn_waiter(lobby.clone(), &cfg);
                self.streamer
                    .register_local(&lobby.id, &req.player_id, tx)
                    .await;

                Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::JoinLobbyStream))
            }
            Err(err) => {
                error!(
                    player_id = %req.player_id,
                    mode = %req.mode,
                    error = %err,
                    "Failed to create lobby"
                );

                let status = LobbyStatus {
                    status: StatusCode::Error as i32,
                    ..Default::default()
                };
                // Buffered before the receiver is handed back: the client
                // sees one ERROR frame, then end of stream.
                let _ = tx.send(Ok(status)).await;

                Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::JoinLobbyStream))
            }
        }
    }
}
