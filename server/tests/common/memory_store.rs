use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ::common::{Lobby, LobbyError, Player};
use server::score::ScoreProviders;
use server::store::{LobbyStore, StoreError, StoreResult};
use tokio::sync::Mutex;

/// Mirrors the Redis store's body-retention grace: expired bodies linger
/// briefly so the waiter can observe the expiry before the record vanishes.
const BODY_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Inner {
    lobbies: HashMap<String, Lobby>,
    versions: HashMap<String, u16>,
    /// mode -> lobby id -> score
    open: HashMap<String, HashMap<String, f64>>,
}

/// In-memory `LobbyStore` with the same observable semantics as the Redis
/// implementation: expired bodies cease to exist, stale open-set ids are
/// evicted lazily, full lobbies leave the open set, version writes are
/// monotone and player inserts are serialized.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    scores: ScoreProviders,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            scores: ScoreProviders::new(),
        }
    }

    pub async fn open_set_contains(&self, mode: &str, id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .open
            .get(mode)
            .is_some_and(|entries| entries.contains_key(id))
    }

    pub async fn stored_version(&self, id: &str) -> Option<u16> {
        self.inner.lock().await.versions.get(id).copied()
    }

    fn body_gone(lobby: &Lobby, now: DateTime<Utc>) -> bool {
        now > lobby.expire_at + BODY_GRACE
    }
}

#[async_trait]
impl LobbyStore for MemoryStore {
    async fn add_lobby(&self, lobby: &Lobby) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;

        inner.lobbies.insert(lobby.id.clone(), lobby.clone());
        inner.versions.insert(lobby.id.clone(), lobby.version);

        if !lobby.is_full() {
            let score = self.scores.get(&lobby.mode).calculate_score(lobby);
            inner
                .open
                .entry(lobby.mode.clone())
                .or_default()
                .insert(lobby.id.clone(), score);
        }

        Ok(())
    }

    async fn get_lobby(&self, id: &str) -> StoreResult<Lobby> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        match inner.lobbies.get(id) {
            Some(lobby) if !Self::body_gone(lobby, now) => Ok(lobby.clone()),
            Some(_) => {
                inner.lobbies.remove(id);
                inner.versions.remove(id);
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn get_top_lobbies(&self, mode: &str, limit: usize) -> StoreResult<Vec<Lobby>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let Some(entries) = inner.open.get(mode) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(String, f64)> =
            entries.iter().map(|(id, score)| (id.clone(), *score)).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut lobbies = Vec::new();
        let mut stale = Vec::new();

        for (id, _) in scored.into_iter().take(limit) {
            match inner.lobbies.get(&id) {
                Some(lobby) if !Self::body_gone(lobby, now) => {
                    if !lobby.is_full() {
                        lobbies.push(lobby.clone());
                    }
                }
                _ => stale.push(id),
            }
        }

        for id in stale {
            if let Some(entries) = inner.open.get_mut(mode) {
                entries.remove(&id);
            }
        }

        Ok(lobbies)
    }

    async fn add_player(&self, id: &str, player: Player) -> StoreResult<Lobby> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut lobby = match inner.lobbies.get(id) {
            Some(lobby) if !Self::body_gone(lobby, now) => lobby.clone(),
            _ => return Err(StoreError::NotFound),
        };

        match lobby.add_player(player) {
            Ok(()) => {}
            Err(LobbyError::Full) => return Err(StoreError::Full),
        }

        inner.lobbies.insert(id.to_string(), lobby.clone());
        inner.versions.insert(id.to_string(), lobby.version);

        if lobby.is_full() {
            if let Some(entries) = inner.open.get_mut(&lobby.mode) {
                entries.remove(id);
            }
        } else {
            let score = self.scores.get(&lobby.mode).calculate_score(&lobby);
            inner
                .open
                .entry(lobby.mode.clone())
                .or_default()
                .insert(id.to_string(), score);
        }

        Ok(lobby)
    }

    async fn atomic_update_lobby(&self, lobby: &Lobby) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;

        let current = inner.versions.get(&lobby.id).copied().unwrap_or(0);
        if current >= lobby.version {
            return Ok(());
        }

        inner.lobbies.insert(lobby.id.clone(), lobby.clone());
        inner.versions.insert(lobby.id.clone(), lobby.version);

        if lobby.is_full() {
            if let Some(entries) = inner.open.get_mut(&lobby.mode) {
                entries.remove(&lobby.id);
            }
        } else {
            let score = self.scores.get(&lobby.mode).calculate_score(lobby);
            inner
                .open
                .entry(lobby.mode.clone())
                .or_default()
                .insert(lobby.id.clone(), score);
        }

        Ok(())
    }

    async fn remove_lobby(&self, id: &str, mode: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;

        inner.lobbies.remove(id);
        inner.versions.remove(id);
        if let Some(entries) = inner.open.get_mut(mode) {
            entries.remove(id);
        }

        Ok(())
    }
}
