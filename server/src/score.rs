//! Open-set score providers.
//!
//! These scores order the per-mode sorted set in the store, so "better"
//! lobbies surface first in `get_top_lobbies`. They are distinct from the
//! matcher weights: the store score ranks lobbies on their own (fill, age,
//! balance), the matcher score ranks them against the joining player.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use common::{Lobby, modes};

pub trait ScoreProvider: Send + Sync {
    fn calculate_score(&self, lobby: &Lobby) -> f64;
}

fn age_seconds(lobby: &Lobby) -> f64 {
    (Utc::now() - lobby.created_at).num_milliseconds() as f64 / 1000.0
}

fn rating_spread(lobby: &Lobby) -> f64 {
    let ratings = lobby.players.iter().map(|p| p.rating);
    match (ratings.clone().min(), ratings.max()) {
        (Some(min), Some(max)) => (max - min) as f64,
        _ => 0.0,
    }
}

pub struct StandardScoreProvider;

impl ScoreProvider for StandardScoreProvider {
    fn calculate_score(&self, lobby: &Lobby) -> f64 {
        lobby.categories.len() as f64 + age_seconds(lobby) + lobby.player_count() as f64
    }
}

/// Steps the score up as a battle lobby approaches capacity, so nearly-full
/// lobbies are retrieved ahead of fresh ones.
pub struct BattleScoreProvider;

impl ScoreProvider for BattleScoreProvider {
    fn calculate_score(&self, lobby: &Lobby) -> f64 {
        let mut score = lobby.categories.len() as f64 + age_seconds(lobby);

        score += match lobby.player_count() {
            2 => 100.0,
            3 => 150.0,
            4 => 200.0,
            _ => 0.0,
        };

        score
    }
}

pub struct BlitzScoreProvider;

impl ScoreProvider for BlitzScoreProvider {
    fn calculate_score(&self, lobby: &Lobby) -> f64 {
        lobby.categories.len() as f64 + age_seconds(lobby) + lobby.player_count() as f64
    }
}

pub struct ClassicScoreProvider;

impl ScoreProvider for ClassicScoreProvider {
    fn calculate_score(&self, lobby: &Lobby) -> f64 {
        let cat_score = (lobby.categories.len() as f64 / 15.0).min(1.0);
        let fill_score = lobby.player_count() as f64 / 10.0;

        let balance_score = if lobby.player_count() > 1 {
            1.0 - rating_spread(lobby) / 1500.0
        } else {
            1.0
        };

        cat_score * 0.5 + fill_score * 0.3 + balance_score * 0.2
    }
}

/// Empty duel lobbies compete on age; seeded ones on their rating.
pub struct DuelScoreProvider;

impl ScoreProvider for DuelScoreProvider {
    fn calculate_score(&self, lobby: &Lobby) -> f64 {
        if lobby.players.is_empty() {
            return age_seconds(lobby);
        }
        lobby.avg_rating as f64
    }
}

pub struct MegaScoreProvider;

impl ScoreProvider for MegaScoreProvider {
    fn calculate_score(&self, lobby: &Lobby) -> f64 {
        lobby.player_count() as f64 * 2.0 + age_seconds(lobby)
    }
}

pub struct TeamScoreProvider;

impl ScoreProvider for TeamScoreProvider {
    fn calculate_score(&self, lobby: &Lobby) -> f64 {
        let fill_score = lobby.player_count() as f64 / 4.0;
        let cat_score = (lobby.categories.len() as f64 / 10.0).min(1.0);

        let balance_score = if lobby.player_count() > 1 {
            1.0 - rating_spread(lobby) / 1000.0
        } else {
            1.0
        };

        fill_score * 0.4 + cat_score * 0.3 + balance_score * 0.3
    }
}

/// Resolves a mode name to its score provider; unregistered modes fall back
/// to the standard provider and are cached on first use.
pub struct ScoreProviders {
    providers: RwLock<HashMap<String, Arc<dyn ScoreProvider>>>,
}

impl Default for ScoreProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoreProviders {
    pub fn new() -> Self {
        let mut providers: HashMap<String, Arc<dyn ScoreProvider>> = HashMap::new();
        providers.insert(modes::CLASSIC.to_string(), Arc::new(ClassicScoreProvider));
        providers.insert(modes::BATTLE.to_string(), Arc::new(BattleScoreProvider));
        providers.insert(modes::BLITZ.to_string(), Arc::new(BlitzScoreProvider));
        providers.insert(modes::MEGA.to_string(), Arc::new(MegaScoreProvider));
        providers.insert(modes::TEAM.to_string(), Arc::new(TeamScoreProvider));
        providers.insert(modes::DUEL.to_string(), Arc::new(DuelScoreProvider));

        Self {
            providers: RwLock::new(providers),
        }
    }

    pub fn get(&self, mode: &str) -> Arc<dyn ScoreProvider> {
        if let Some(provider) = self.providers.read().unwrap().get(mode) {
            return provider.clone();
        }

        let mut providers = self.providers.write().unwrap();
        providers
            .entry(mode.to_string())
            .or_insert_with(|| Arc::new(StandardScoreProvider))
            .clone()
    }
}
