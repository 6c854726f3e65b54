use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use common::Lobby;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WaiterConfig;
use crate::lobbyv1::{LobbyStatus, Status};
use crate::metrics;
use crate::store::LobbyStore;
use crate::streamer::StreamManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    Waiting,
    Ready,
    Expired,
    Inactive,
}

/// Evaluated top-down every tick; the first match wins, so expiry beats
/// readiness for a lobby that is both.
pub fn determine_state(lobby: &Lobby, cfg: &WaiterConfig, now: DateTime<Utc>) -> LobbyState {
    if now > lobby.expire_at {
        return LobbyState::Expired;
    }

    let age = (now - lobby.created_at).to_std().unwrap_or_default();
    if lobby.players.is_empty() && age > cfg.max_lobby_wait() {
        return LobbyState::Inactive;
    }

    if is_lobby_ready(lobby, cfg, now) {
        return LobbyState::Ready;
    }

    LobbyState::Waiting
}

fn is_lobby_ready(lobby: &Lobby, cfg: &WaiterConfig, now: DateTime<Utc>) -> bool {
    let player_count = lobby.player_count();
    if player_count < lobby.min_players as usize {
        return false;
    }

    let is_full = player_count >= lobby.max_players as usize;
    let since_last_join = (now - lobby.last_joined_at).to_std().unwrap_or_default();

    is_full || since_last_join >= cfg.min_ready_duration()
}

/// A lobby that has its minimum but is about to expire gets more time rather
/// than timing out under its players.
fn should_extend(lobby: &Lobby, cfg: &WaiterConfig, now: DateTime<Utc>) -> bool {
    if now > lobby.expire_at {
        return false;
    }

    let has_min_players = lobby.player_count() >= lobby.min_players as usize;
    let time_remaining = (lobby.expire_at - now).to_std().unwrap_or_default();

    has_min_players && time_remaining < cfg.lobby_idle_extend()
}

/// Per-lobby cooperative lifecycle task. Exactly one waiter runs per lobby
/// across the cluster: only the creating node spawns one, other nodes just
/// subscribe to its frames.
pub struct Waiter {
    store: Arc<dyn LobbyStore>,
    streamer: Arc<StreamManager>,
    config: RwLock<WaiterConfig>,
}

impl Waiter {
    pub fn new(store: Arc<dyn LobbyStore>, streamer: Arc<StreamManager>, cfg: WaiterConfig) -> Self {
        Self {
            store,
            streamer,
            config: RwLock::new(cfg),
        }
    }

    pub fn update_config(&self, new_cfg: WaiterConfig) {
        *self.config.write().unwrap() = new_cfg;
    }

    fn config(&self) -> WaiterConfig {
        self.config.read().unwrap().clone()
    }

    /// Ticks until the lobby reaches a terminal state or the token fires.
    /// Cancellation exits silently; subscribers detect their own stream
    /// closure.
    pub async fn wait_for_lobby_fill(&self, token: CancellationToken, lobby: Lobby) {
        let lobby_id = lobby.id.clone();
        let mode = lobby.mode.clone();

        metrics::MODE_LOBBIES_COUNT.with_label_values(&[&mode]).inc();

        let mut ticker = interval(self.config().ticker_timeout());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(lobby_id = %lobby_id, "Waiter cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let updated = match self.store.get_lobby(&lobby_id).await {
                Ok(l) => l,
                Err(err) => {
                    error!(lobby_id = %lobby_id, error = %err, "Failed to re-read lobby");
                    self.handle_error_state(&lobby_id).await;
                    break;
                }
            };

            let cfg = self.config();
            let now = Utc::now();

            match determine_state(&updated, &cfg, now) {
                LobbyState::Expired => {
                    self.handle_expired_lobby(&updated).await;
                    break;
                }
                LobbyState::Inactive => {
                    self.handle_inactive_lobby(&updated).await;
                    break;
                }
                LobbyState::Ready => {
                    self.handle_ready_lobby(&updated).await;
                    break;
                }
                LobbyState::Waiting => {
                    self.handle_waiting_state(updated, &cfg, now).await;
                }
            }
        }

        metrics::MODE_LOBBIES_COUNT.with_label_values(&[&mode]).dec();
        let _ = metrics::LOBBY_PLAYERS_COUNT.remove_label_values(&[&lobby_id, &mode]);
    }

    /// Removal precedes the broadcast so no joiner lands in a starting
    /// lobby; frames are self-contained for slow remote subscribers.
    async fn handle_ready_lobby(&self, lobby: &Lobby) {
        metrics::LOBBY_STATUS_CHANGES
            .with_label_values(&["starting"])
            .inc();

        let status = LobbyStatus {
            lobby_id: lobby.id.clone(),
            status: Status::Starting as i32,
            current_players: lobby.player_count() as i32,
            max_players: lobby.max_players as i32,
            game_id: String::new(),
        };

        self.remove_lobby(lobby, "starting").await;
        self.broadcast_status(&lobby.id, &status).await;

        let waited = (Utc::now() - lobby.created_at).num_milliseconds() as f64 / 1000.0;
        metrics::LOBBY_WAIT_TIME
            .with_label_values(&[&lobby.mode])
            .observe(waited);

        info!(
            lobby_id = %lobby.id,
            mode = %lobby.mode,
            players = lobby.player_count(),
            wait_seconds = waited,
            "Lobby starting"
        );
    }

    async fn handle_expired_lobby(&self, lobby: &Lobby) {
        metrics::LOBBY_STATUS_CHANGES
            .with_label_values(&["timeout"])
            .inc();

        let status = LobbyStatus {
            lobby_id: lobby.id.clone(),
            status: Status::Timeout as i32,
            current_players: lobby.player_count() as i32,
            max_players: lobby.max_players as i32,
            game_id: String::new(),
        };

        self.remove_lobby(lobby, "timeout").await;
        self.broadcast_status(&lobby.id, &status).await;

        info!(lobby_id = %lobby.id, mode = %lobby.mode, "Lobby expired");
    }

    /// Nobody ever joined; there is no one to notify.
    async fn handle_inactive_lobby(&self, lobby: &Lobby) {
        metrics::LOBBY_STATUS_CHANGES
            .with_label_values(&["inactive"])
            .inc();

        self.remove_lobby(lobby, "inactive").await;

        info!(lobby_id = %lobby.id, "Lobby removed due to inactivity");
    }

    /// Local subscribers only: if the store is unreachable, the bridge
    /// publish would likely fail too, and other nodes run their own error
    /// handling.
    async fn handle_error_state(&self, lobby_id: &str) {
        metrics::LOBBY_STATUS_CHANGES
            .with_label_values(&["error"])
            .inc();

        let status = LobbyStatus {
            lobby_id: lobby_id.to_string(),
            status: Status::Error as i32,
            ..Default::default()
        };

        self.streamer.broadcast_lobby_update(lobby_id, &status).await;
    }

    async fn handle_waiting_state(&self, mut lobby: Lobby, cfg: &WaiterConfig, now: DateTime<Utc>) {
        if should_extend(&lobby, cfg, now) {
            lobby.expire_at = lobby.expire_at + cfg.lobby_idle_extend();
            lobby.bump_version();

            // Persisted with a bumped version so a joiner's concurrent write
            // cannot silently undo the extension.
            match self.store.atomic_update_lobby(&lobby).await {
                Ok(()) => debug!(
                    lobby_id = %lobby.id,
                    expire_at = %lobby.expire_at,
                    "Extended lobby wait"
                ),
                Err(err) => warn!(
                    lobby_id = %lobby.id,
                    error = %err,
                    "Failed to persist lobby extension"
                ),
            }
        }

        metrics::LOBBY_PLAYERS_COUNT
            .with_label_values(&[&lobby.id, &lobby.mode])
            .set(lobby.player_count() as i64);

        let status = LobbyStatus {
            lobby_id: lobby.id.clone(),
            status: Status::Waiting as i32,
            current_players: lobby.player_count() as i32,
            max_players: lobby.max_players as i32,
            game_id: String::new(),
        };

        self.broadcast_status(&lobby.id, &status).await;
    }

    async fn remove_lobby(&self, lobby: &Lobby, reason: &str) {
        if let Err(err) = self.store.remove_lobby(&lobby.id, &lobby.mode).await {
            warn!(
                lobby_id = %lobby.id,
                reason,
                error = %err,
                "Failed to remove lobby"
            );
        }

        debug!(lobby_id = %lobby.id, reason, "Lobby removed");
    }

    async fn broadcast_status(&self, lobby_id: &str, status: &LobbyStatus) {
        self.streamer.broadcast_lobby_update(lobby_id, status).await;

        if let Err(err) = self.streamer.publish_lobby_status(lobby_id, status).await {
            warn!(lobby_id, error = %err, "Failed to publish lobby status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Player;
    use std::time::Duration;

    fn cfg() -> WaiterConfig {
        WaiterConfig::default()
    }

    fn lobby_with(players: usize, min: i16, max: i16) -> Lobby {
        let now = Utc::now();
        let mut l = Lobby::new("w1", "classic", min, max, now, now + Duration::from_secs(120));
        for i in 0..players {
            l.add_player(Player::new(format!("p{i}"), 1000, vec![1])).unwrap();
        }
        l
    }

    #[test]
    fn expiry_wins_over_readiness() {
        let mut l = lobby_with(4, 2, 4);
        l.expire_at = Utc::now() - chrono::Duration::seconds(1);

        assert_eq!(determine_state(&l, &cfg(), Utc::now()), LobbyState::Expired);
    }

    #[test]
    fn empty_lobby_goes_inactive_after_max_wait() {
        let mut l = lobby_with(0, 2, 4);
        l.created_at = Utc::now() - chrono::Duration::seconds(120);

        assert_eq!(determine_state(&l, &cfg(), Utc::now()), LobbyState::Inactive);
    }

    #[test]
    fn seeded_lobby_never_goes_inactive() {
        let mut l = lobby_with(1, 2, 4);
        l.created_at = Utc::now() - chrono::Duration::seconds(120);

        assert_eq!(determine_state(&l, &cfg(), Utc::now()), LobbyState::Waiting);
    }

    #[test]
    fn full_lobby_is_ready_immediately() {
        let l = lobby_with(4, 2, 4);
        assert_eq!(determine_state(&l, &cfg(), Utc::now()), LobbyState::Ready);
    }

    #[test]
    fn min_players_need_quiet_period_before_ready() {
        let mut l = lobby_with(2, 2, 4);

        // just joined: keep waiting for stragglers
        assert_eq!(determine_state(&l, &cfg(), Utc::now()), LobbyState::Waiting);

        l.last_joined_at = Utc::now() - chrono::Duration::seconds(11);
        assert_eq!(determine_state(&l, &cfg(), Utc::now()), LobbyState::Ready);
    }

    #[test]
    fn below_min_players_keeps_waiting() {
        let mut l = lobby_with(1, 2, 4);
        l.last_joined_at = Utc::now() - chrono::Duration::seconds(60);

        assert_eq!(determine_state(&l, &cfg(), Utc::now()), LobbyState::Waiting);
    }

    #[test]
    fn extension_applies_only_near_expiry_with_min_players() {
        let now = Utc::now();

        let mut near = lobby_with(2, 2, 4);
        near.expire_at = now + Duration::from_secs(5);
        assert!(should_extend(&near, &cfg(), now));

        let mut distant = lobby_with(2, 2, 4);
        distant.expire_at = now + Duration::from_secs(60);
        assert!(!should_extend(&distant, &cfg(), now));

        let mut under_min = lobby_with(1, 2, 4);
        under_min.expire_at = now + Duration::from_secs(5);
        assert!(!should_extend(&under_min, &cfg(), now));

        let mut past = lobby_with(2, 2, 4);
        past.expire_at = now - Duration::from_secs(1);
        assert!(!should_extend(&past, &cfg(), now));
    }
}
