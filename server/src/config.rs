use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::matcher::MatcherConfig;

pub const MIN_LOBBY_TTL: Duration = Duration::from_secs(60);
pub const MIN_LOBBY_ATTEMPTS: u32 = 2;
pub const MIN_TOP_LOBBIES_LIMIT: usize = 10;

pub const MIN_TICKER_TIMEOUT: Duration = Duration::from_millis(500);
pub const MIN_MAX_LOBBY_WAIT: Duration = Duration::from_secs(30);
pub const MIN_LOBBY_IDLE_EXTEND: Duration = Duration::from_secs(10);
pub const MIN_READY_DURATION: Duration = Duration::from_secs(10);

/// Capacity bounds for a mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatPair {
    pub min: i16,
    pub max: i16,
}

/// Join-handler tunables. Floors are enforced by the getters, not at load
/// time, so a bad runtime update degrades to the floor instead of sticking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    pub mode_stats: HashMap<String, StatPair>,
    pub lobby_ttl: Duration,
    pub max_lobby_attempts: u32,
    pub top_lobbies_limit: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        let mode_stats = HashMap::from([
            (common::modes::DUEL.to_string(), StatPair { min: 2, max: 2 }),
            (common::modes::BATTLE.to_string(), StatPair { min: 2, max: 4 }),
            (common::modes::BLITZ.to_string(), StatPair { min: 3, max: 6 }),
            (common::modes::TEAM.to_string(), StatPair { min: 4, max: 4 }),
            (common::modes::CLASSIC.to_string(), StatPair { min: 4, max: 10 }),
            (common::modes::MEGA.to_string(), StatPair { min: 24, max: 128 }),
        ]);

        Self {
            mode_stats,
            lobby_ttl: Duration::from_secs(4 * 60),
            max_lobby_attempts: 3,
            top_lobbies_limit: 25,
        }
    }
}

impl HandlerConfig {
    pub fn lobby_ttl(&self) -> Duration {
        self.lobby_ttl.max(MIN_LOBBY_TTL)
    }

    pub fn max_lobby_attempts(&self) -> u32 {
        self.max_lobby_attempts.max(MIN_LOBBY_ATTEMPTS)
    }

    pub fn top_lobbies_limit(&self) -> usize {
        self.top_lobbies_limit.max(MIN_TOP_LOBBIES_LIMIT)
    }

    pub fn mode_stats(&self, mode: &str) -> StatPair {
        self.mode_stats
            .get(mode)
            .copied()
            .unwrap_or(StatPair { min: 4, max: 8 })
    }
}

/// Waiter tunables (the `lobby` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaiterConfig {
    pub ticker_timeout: Duration,
    pub max_lobby_wait: Duration,
    pub lobby_idle_extend: Duration,
    pub min_ready_duration: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            ticker_timeout: Duration::from_secs(1),
            max_lobby_wait: Duration::from_secs(60),
            lobby_idle_extend: Duration::from_secs(15),
            min_ready_duration: Duration::from_secs(10),
        }
    }
}

impl WaiterConfig {
    pub fn ticker_timeout(&self) -> Duration {
        self.ticker_timeout.max(MIN_TICKER_TIMEOUT)
    }

    pub fn max_lobby_wait(&self) -> Duration {
        self.max_lobby_wait.max(MIN_MAX_LOBBY_WAIT)
    }

    pub fn lobby_idle_extend(&self) -> Duration {
        self.lobby_idle_extend.max(MIN_LOBBY_IDLE_EXTEND)
    }

    pub fn min_ready_duration(&self) -> Duration {
        self.min_ready_duration.max(MIN_READY_DURATION)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub handler: HandlerConfig,
    pub lobby: WaiterConfig,
    pub matcher: MatcherConfig,
    pub redis: RedisConfig,
}

impl Config {
    /// Defaults overridden by environment variables where provided.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(url) = env::var("LOBBY_REDIS_URL") {
            cfg.redis.url = url;
        }
        if let Some(ttl) = env_secs("LOBBY_TTL_SECS") {
            cfg.handler.lobby_ttl = ttl;
        }
        if let Some(wait) = env_secs("LOBBY_MAX_WAIT_SECS") {
            cfg.lobby.max_lobby_wait = wait;
        }

        cfg
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env::var(name).ok()?.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_floors_apply_on_read() {
        let cfg = HandlerConfig {
            lobby_ttl: Duration::from_secs(5),
            max_lobby_attempts: 0,
            top_lobbies_limit: 3,
            ..Default::default()
        };

        assert_eq!(cfg.lobby_ttl(), MIN_LOBBY_TTL);
        assert_eq!(cfg.max_lobby_attempts(), MIN_LOBBY_ATTEMPTS);
        assert_eq!(cfg.top_lobbies_limit(), MIN_TOP_LOBBIES_LIMIT);
    }

    #[test]
    fn handler_defaults_pass_floors_unchanged() {
        let cfg = HandlerConfig::default();
        assert_eq!(cfg.lobby_ttl(), Duration::from_secs(240));
        assert_eq!(cfg.max_lobby_attempts(), 3);
        assert_eq!(cfg.top_lobbies_limit(), 25);
    }

    #[test]
    fn waiter_floors_apply_on_read() {
        let cfg = WaiterConfig {
            ticker_timeout: Duration::from_millis(10),
            max_lobby_wait: Duration::from_secs(1),
            lobby_idle_extend: Duration::from_secs(1),
            min_ready_duration: Duration::from_secs(1),
        };

        assert_eq!(cfg.ticker_timeout(), MIN_TICKER_TIMEOUT);
        assert_eq!(cfg.max_lobby_wait(), MIN_MAX_LOBBY_WAIT);
        assert_eq!(cfg.lobby_idle_extend(), MIN_LOBBY_IDLE_EXTEND);
        assert_eq!(cfg.min_ready_duration(), MIN_READY_DURATION);
    }

    #[test]
    fn unknown_mode_gets_fallback_stats() {
        let cfg = HandlerConfig::default();
        let stats = cfg.mode_stats("ranked-unknown");
        assert_eq!(stats.min, 4);
        assert_eq!(stats.max, 8);

        let duel = cfg.mode_stats(common::modes::DUEL);
        assert_eq!((duel.min, duel.max), (2, 2));
    }
}
