use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{Lobby, LobbyError, Player};
use once_cell::sync::Lazy;
use rand::Rng;
use rand::distributions::Alphanumeric;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, Script, SetExpiry, SetOptions};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::redis_keys::RedisKeys;
use crate::score::ScoreProviders;

const LOCK_TTL_MS: u64 = 5_000;
const LOCK_RETRY_ATTEMPTS: u32 = 5;
const LOCK_RETRY_MIN_MS: u64 = 100;
const LOCK_RETRY_MAX_MS: u64 = 300;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lobby not found")]
    NotFound,
    #[error("lobby is full")]
    Full,
    #[error("lobby lock acquisition timed out")]
    LockTimeout,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared lobby state. All nodes read and mutate through this interface; the
/// implementation is responsible for atomicity and the per-lobby named mutex.
#[async_trait]
pub trait LobbyStore: Send + Sync {
    /// Persists a fresh lobby and inserts it into its mode's open set.
    async fn add_lobby(&self, lobby: &Lobby) -> StoreResult<()>;

    async fn get_lobby(&self, id: &str) -> StoreResult<Lobby>;

    /// Returns up to `limit` open lobbies in descending score order. Ids whose
    /// body has expired are evicted from the open set as a side effect; full
    /// lobbies are skipped.
    async fn get_top_lobbies(&self, mode: &str, limit: usize) -> StoreResult<Vec<Lobby>>;

    /// Inserts a player under the lobby's named mutex and returns the updated
    /// record. Fails with `Full`, `NotFound` or `LockTimeout`.
    async fn add_player(&self, id: &str, player: Player) -> StoreResult<Lobby>;

    /// Version-guarded write: a stored version >= the incoming one makes this
    /// a silent no-op. A successful swap re-scores the open set and resets
    /// the TTL.
    async fn atomic_update_lobby(&self, lobby: &Lobby) -> StoreResult<()>;

    /// Deletes body, version and open-set membership.
    async fn remove_lobby(&self, id: &str, mode: &str) -> StoreResult<()>;
}

static RELEASE_LOCK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
    "#,
    )
});

static UPDATE_IF_NEWER: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local current = tonumber(redis.call("get", KEYS[2]) or "0")
        local incoming = tonumber(ARGV[2])
        if current >= incoming then
            return 0
        end
        redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[3])
        redis.call("set", KEYS[2], ARGV[2], "PX", ARGV[3])
        return 1
    "#,
    )
});

/// Redis-backed store. Body, version and lock keys share a hash tag per
/// lobby; the per-mode open set hashes separately, so multi-key pipelines
/// touching both assume a non-cluster deployment or a cluster proxy.
pub struct RedisStore {
    conn: ConnectionManager,
    scores: Arc<ScoreProviders>,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, scores: Arc<ScoreProviders>) -> Self {
        Self { conn, scores }
    }

    async fn acquire_lock(&self, key: &str) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        let token = lock_token();

        for attempt in 1..=LOCK_RETRY_ATTEMPTS {
            let acquired: bool = conn
                .set_options(
                    key,
                    &token,
                    SetOptions::default()
                        .conditional_set(ExistenceCheck::NX)
                        .with_expiration(SetExpiry::PX(LOCK_TTL_MS)),
                )
                .await?;

            if acquired {
                return Ok(token);
            }

            if attempt < LOCK_RETRY_ATTEMPTS {
                let backoff = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(LOCK_RETRY_MIN_MS..=LOCK_RETRY_MAX_MS)
                };
                sleep(Duration::from_millis(backoff)).await;
            }
        }

        Err(StoreError::LockTimeout)
    }

    /// The lock TTL covers us if this fails; the next holder just waits it
    /// out.
    async fn release_lock(&self, key: &str, token: &str) {
        let mut conn = self.conn.clone();
        let released: Result<i32, _> = RELEASE_LOCK.key(key).arg(token).invoke_async(&mut conn).await;

        if let Err(err) = released {
            warn!(key, error = %err, "Failed to release lobby lock");
        }
    }

    async fn add_player_locked(&self, id: &str, player: Player) -> StoreResult<Lobby> {
        let mut lobby = self.get_lobby(id).await?;

        match lobby.add_player(player) {
            Ok(()) => {}
            Err(LobbyError::Full) => return Err(StoreError::Full),
        }

        self.write_lobby(&lobby).await?;
        Ok(lobby)
    }

    /// Writes body + version and refreshes the open-set placement. A full
    /// lobby leaves the open set instead of being re-scored.
    async fn write_lobby(&self, lobby: &Lobby) -> StoreResult<()> {
        let body = serde_json::to_string(lobby)?;
        let ttl_ms = ttl_millis(lobby);
        let open_key = RedisKeys::open_lobbies(&lobby.mode);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .pset_ex(RedisKeys::lobby_body(&lobby.id), &body, ttl_ms)
            .pset_ex(RedisKeys::lobby_version(&lobby.id), lobby.version, ttl_ms);

        if lobby.is_full() {
            pipe.zrem(&open_key, &lobby.id);
        } else {
            let score = self.scores.get(&lobby.mode).calculate_score(lobby);
            pipe.zadd(&open_key, &lobby.id, score);
            pipe.pexpire(&open_key, ttl_ms as i64);
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    fn rescore_pipe(&self, lobby: &Lobby) -> redis::Pipeline {
        let open_key = RedisKeys::open_lobbies(&lobby.mode);
        let mut pipe = redis::pipe();

        if lobby.is_full() {
            pipe.zrem(&open_key, &lobby.id);
        } else {
            let score = self.scores.get(&lobby.mode).calculate_score(lobby);
            pipe.zadd(&open_key, &lobby.id, score);
            pipe.pexpire(&open_key, ttl_millis(lobby) as i64);
        }

        pipe
    }
}

#[async_trait]
impl LobbyStore for RedisStore {
    async fn add_lobby(&self, lobby: &Lobby) -> StoreResult<()> {
        let body = serde_json::to_string(lobby)?;
        let ttl_ms = ttl_millis(lobby);
        let open_key = RedisKeys::open_lobbies(&lobby.mode);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .pset_ex(RedisKeys::lobby_body(&lobby.id), &body, ttl_ms)
            .pset_ex(RedisKeys::lobby_version(&lobby.id), lobby.version, ttl_ms);

        if !lobby.is_full() {
            let score = self.scores.get(&lobby.mode).calculate_score(lobby);
            pipe.zadd(&open_key, &lobby.id, score);
            pipe.pexpire(&open_key, ttl_ms as i64);
        }

        let _: () = pipe.query_async(&mut conn).await?;

        debug!(lobby_id = %lobby.id, mode = %lobby.mode, "Lobby cached");
        Ok(())
    }

    async fn get_lobby(&self, id: &str) -> StoreResult<Lobby> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(RedisKeys::lobby_body(id)).await?;
        let data = data.ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn get_top_lobbies(&self, mode: &str, limit: usize) -> StoreResult<Vec<Lobby>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let open_key = RedisKeys::open_lobbies(mode);
        let mut conn = self.conn.clone();

        let ids: Vec<String> = conn.zrevrange(&open_key, 0, limit as isize - 1).await?;

        let mut lobbies = Vec::with_capacity(ids.len());
        let mut stale: Vec<String> = Vec::new();

        for id in ids {
            let data: Option<String> = conn.get(RedisKeys::lobby_body(&id)).await?;
            let Some(raw) = data else {
                stale.push(id);
                continue;
            };

            match serde_json::from_str::<Lobby>(&raw) {
                Ok(lobby) => {
                    if !lobby.is_full() {
                        lobbies.push(lobby);
                    }
                }
                Err(err) => {
                    warn!(lobby_id = %id, error = %err, "Failed to decode lobby body, evicting");
                    stale.push(id);
                }
            }
        }

        if !stale.is_empty() {
            debug!(mode, count = stale.len(), "Evicting stale ids from open set");
            if let Err(err) = conn.zrem::<_, _, ()>(&open_key, &stale).await {
                warn!(mode, error = %err, "Failed to evict stale open-set ids");
            }
        }

        Ok(lobbies)
    }

    async fn add_player(&self, id: &str, player: Player) -> StoreResult<Lobby> {
        let lock_key = RedisKeys::lobby_lock(id);
        let token = self.acquire_lock(&lock_key).await?;

        let result = self.add_player_locked(id, player).await;

        self.release_lock(&lock_key, &token).await;
        result
    }

    async fn atomic_update_lobby(&self, lobby: &Lobby) -> StoreResult<()> {
        let body = serde_json::to_string(lobby)?;
        let ttl_ms = ttl_millis(lobby);

        let mut conn = self.conn.clone();
        let swapped: i32 = UPDATE_IF_NEWER
            .key(RedisKeys::lobby_body(&lobby.id))
            .key(RedisKeys::lobby_version(&lobby.id))
            .arg(&body)
            .arg(lobby.version)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        if swapped == 0 {
            debug!(lobby_id = %lobby.id, version = lobby.version, "Stale lobby update ignored");
            return Ok(());
        }

        // The open set lives in its own slot, so it is re-scored after the
        // swap rather than inside the script.
        let _: () = self.rescore_pipe(lobby).query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_lobby(&self, id: &str, mode: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(RedisKeys::lobby_body(id))
            .del(RedisKeys::lobby_version(id))
            .zrem(RedisKeys::open_lobbies(mode), id);

        let _: () = pipe.query_async(&mut conn).await?;

        debug!(lobby_id = %id, mode, "Lobby removed");
        Ok(())
    }
}

const TTL_GRACE_MS: i64 = 5_000;

/// TTL runs a beat behind `expire_at`: the waiter removes expired lobbies
/// itself, the TTL is the recovery path when its node is gone.
fn ttl_millis(lobby: &Lobby) -> u64 {
    ((lobby.expire_at - Utc::now()).num_milliseconds() + TTL_GRACE_MS).max(1) as u64
}

fn lock_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
