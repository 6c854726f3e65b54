//! Mode-aware candidate selection.
//!
//! Each mode resolves to a `{filter, score}` pair parameterized by config
//! weights. The filter gates compatibility (category overlap, rating bands),
//! the score ranks the surviving candidates against the joining player.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use common::{Lobby, Player, modes};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Weight of the rating proximity component, 0 to 1.
    pub rating_weight: f64,
    /// Weight of the category overlap component, 0 to 1.
    pub category_weight: f64,
    /// Weight of the lobby fill component, 0 to 1.
    pub fill_weight: f64,
    /// Rating distance at which the rating component reaches zero.
    pub max_rating_diff: f64,
    /// Minimum Jaccard index between player and lobby categories, 0 to 1.
    pub min_category_match: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            rating_weight: 0.3,
            category_weight: 0.5,
            fill_weight: 0.2,
            max_rating_diff: 1000.0,
            min_category_match: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub configs: HashMap<String, ScoringConfig>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let configs = HashMap::from([
            (
                modes::DUEL.to_string(),
                ScoringConfig {
                    rating_weight: 0.9,
                    category_weight: 0.1,
                    fill_weight: 0.0,
                    min_category_match: 0.0,
                    ..Default::default()
                },
            ),
            (
                modes::BATTLE.to_string(),
                ScoringConfig {
                    rating_weight: 0.7,
                    category_weight: 0.3,
                    fill_weight: 0.0,
                    ..Default::default()
                },
            ),
            (modes::CLASSIC.to_string(), ScoringConfig::default()),
            (modes::BLITZ.to_string(), ScoringConfig::default()),
            (
                modes::TEAM.to_string(),
                ScoringConfig {
                    rating_weight: 0.5,
                    category_weight: 0.4,
                    fill_weight: 0.1,
                    ..Default::default()
                },
            ),
            (
                modes::MEGA.to_string(),
                ScoringConfig {
                    rating_weight: 0.0,
                    category_weight: 0.0,
                    fill_weight: 1.0,
                    min_category_match: 0.0,
                    ..Default::default()
                },
            ),
        ]);

        Self { configs }
    }
}

impl MatcherConfig {
    pub fn get_config(&self, mode: &str) -> ScoringConfig {
        self.configs.get(mode).copied().unwrap_or_default()
    }
}

fn rating_score(player_rating: i32, avg_rating: i32, max_diff: f64) -> f64 {
    if max_diff <= 0.0 {
        return 0.0;
    }
    let diff = (player_rating as f64 - avg_rating as f64).abs();
    (1.0 - diff / max_diff).clamp(0.0, 1.0)
}

fn category_score(player_categories: &[i32], lobby_categories: &[i32]) -> f64 {
    jaccard_index(player_categories, lobby_categories)
}

fn fill_score(player_count: usize, max_players: usize) -> f64 {
    if max_players == 0 {
        return 0.0;
    }
    player_count as f64 / max_players as f64
}

fn jaccard_index(a: &[i32], b: &[i32]) -> f64 {
    let set_a: HashSet<i32> = a.iter().copied().collect();
    let set_b: HashSet<i32> = b.iter().copied().collect();

    let inter = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - inter;
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

fn average_rating(players: &[Player]) -> f64 {
    let sum: f64 = players.iter().map(|p| p.rating as f64).sum();
    sum / players.len() as f64
}

pub trait ModeScorer: Send + Sync {
    fn filter(&self, lobby: &Lobby, player: &Player) -> bool;
    fn score(&self, lobby: &Lobby, player: &Player) -> f64;
}

/// Duels accept anyone; rating proximity dominates the pick.
struct DuelScorer {
    config: ScoringConfig,
}

impl ModeScorer for DuelScorer {
    fn filter(&self, _lobby: &Lobby, _player: &Player) -> bool {
        true
    }

    fn score(&self, lobby: &Lobby, player: &Player) -> f64 {
        self.config.rating_weight
            * rating_score(player.rating, lobby.avg_rating, self.config.max_rating_diff)
            + self.config.category_weight
                * category_score(&player.categories, &lobby.categories)
    }
}

struct BattleScorer {
    config: ScoringConfig,
}

impl ModeScorer for BattleScorer {
    fn filter(&self, lobby: &Lobby, player: &Player) -> bool {
        category_score(&player.categories, &lobby.categories) >= self.config.min_category_match
    }

    fn score(&self, lobby: &Lobby, player: &Player) -> f64 {
        self.config.rating_weight
            * rating_score(player.rating, lobby.avg_rating, self.config.max_rating_diff)
            + self.config.category_weight
                * category_score(&player.categories, &lobby.categories)
    }
}

struct ClassicScorer {
    config: ScoringConfig,
}

impl ModeScorer for ClassicScorer {
    fn filter(&self, lobby: &Lobby, player: &Player) -> bool {
        category_score(&player.categories, &lobby.categories) >= self.config.min_category_match
    }

    fn score(&self, lobby: &Lobby, player: &Player) -> f64 {
        self.config.rating_weight
            * rating_score(player.rating, lobby.avg_rating, self.config.max_rating_diff)
            + self.config.category_weight
                * category_score(&player.categories, &lobby.categories)
            + self.config.fill_weight
                * fill_score(lobby.player_count(), lobby.max_players as usize)
    }
}

/// Blitz blends fill with wait recency so aging lobbies lose ground to fresh
/// fuller ones.
struct BlitzScorer {
    config: ScoringConfig,
}

impl ModeScorer for BlitzScorer {
    fn filter(&self, lobby: &Lobby, player: &Player) -> bool {
        category_score(&player.categories, &lobby.categories) >= self.config.min_category_match
    }

    fn score(&self, lobby: &Lobby, player: &Player) -> f64 {
        let age_minutes = (Utc::now() - lobby.created_at).num_seconds() as f64 / 60.0;
        let wait_time_score = 1.0 - (age_minutes / 10.0).min(1.0);

        self.config.rating_weight
            * rating_score(player.rating, lobby.avg_rating, self.config.max_rating_diff)
            + self.config.category_weight
                * category_score(&player.categories, &lobby.categories)
            + self.config.fill_weight
                * (fill_score(lobby.player_count(), lobby.max_players as usize) * 0.7
                    + wait_time_score * 0.3)
    }
}

struct TeamScorer {
    config: ScoringConfig,
}

impl ModeScorer for TeamScorer {
    fn filter(&self, lobby: &Lobby, player: &Player) -> bool {
        if category_score(&player.categories, &lobby.categories) < self.config.min_category_match {
            return false;
        }

        if !lobby.players.is_empty() {
            let avg_team_rating = average_rating(&lobby.players);
            let rating_diff = (player.rating as f64 - avg_team_rating).abs();
            return rating_diff <= self.config.max_rating_diff * 1.5;
        }

        true
    }

    fn score(&self, lobby: &Lobby, player: &Player) -> f64 {
        let team_balance_score = if lobby.players.is_empty() {
            1.0
        } else {
            let avg_team_rating = average_rating(&lobby.players);
            1.0 - ((player.rating as f64 - avg_team_rating).abs() / self.config.max_rating_diff)
                .min(1.0)
        };

        self.config.rating_weight * team_balance_score
            + self.config.category_weight
                * category_score(&player.categories, &lobby.categories)
            + self.config.fill_weight
                * fill_score(lobby.player_count(), lobby.max_players as usize)
    }
}

/// Mega lobbies take everyone; only fill matters.
struct MegaScorer {
    config: ScoringConfig,
}

impl ModeScorer for MegaScorer {
    fn filter(&self, _lobby: &Lobby, _player: &Player) -> bool {
        true
    }

    fn score(&self, lobby: &Lobby, _player: &Player) -> f64 {
        self.config.fill_weight * fill_score(lobby.player_count(), lobby.max_players as usize)
    }
}

struct DefaultScorer {
    config: ScoringConfig,
}

impl ModeScorer for DefaultScorer {
    fn filter(&self, lobby: &Lobby, player: &Player) -> bool {
        category_score(&player.categories, &lobby.categories) >= self.config.min_category_match
    }

    fn score(&self, lobby: &Lobby, player: &Player) -> f64 {
        self.config.rating_weight
            * rating_score(player.rating, lobby.avg_rating, self.config.max_rating_diff)
            + self.config.category_weight
                * category_score(&player.categories, &lobby.categories)
            + self.config.fill_weight
                * fill_score(lobby.player_count(), lobby.max_players as usize)
    }
}

fn new_scorer(mode: &str, config: ScoringConfig) -> Arc<dyn ModeScorer> {
    match mode {
        modes::DUEL => Arc::new(DuelScorer { config }),
        modes::BATTLE => Arc::new(BattleScorer { config }),
        modes::CLASSIC => Arc::new(ClassicScorer { config }),
        modes::BLITZ => Arc::new(BlitzScorer { config }),
        modes::TEAM => Arc::new(TeamScorer { config }),
        modes::MEGA => Arc::new(MegaScorer { config }),
        _ => Arc::new(DefaultScorer { config }),
    }
}

/// Read-mostly registry of mode scorers; unregistered modes get the default
/// scorer with the default weights, cached on first use.
pub struct Matcher {
    scorers: RwLock<HashMap<String, Arc<dyn ModeScorer>>>,
    config: RwLock<MatcherConfig>,
}

impl Matcher {
    pub fn new(config: MatcherConfig) -> Self {
        let scorers = config
            .configs
            .iter()
            .map(|(mode, cfg)| (mode.clone(), new_scorer(mode, *cfg)))
            .collect();

        Self {
            scorers: RwLock::new(scorers),
            config: RwLock::new(config),
        }
    }

    /// Replaces the weights and rebuilds the scorer table.
    pub fn update_config(&self, new_config: MatcherConfig) {
        let scorers = new_config
            .configs
            .iter()
            .map(|(mode, cfg)| (mode.clone(), new_scorer(mode, *cfg)))
            .collect();

        *self.scorers.write().unwrap() = scorers;
        *self.config.write().unwrap() = new_config;
    }

    fn get_scorer(&self, mode: &str) -> Arc<dyn ModeScorer> {
        if let Some(scorer) = self.scorers.read().unwrap().get(mode) {
            return scorer.clone();
        }

        let config = self.config.read().unwrap().get_config(mode);
        let mut scorers = self.scorers.write().unwrap();
        scorers
            .entry(mode.to_string())
            .or_insert_with(|| new_scorer(mode, config))
            .clone()
    }

    pub fn filter_lobbies<'a>(
        &self,
        mode: &str,
        lobbies: &'a [Lobby],
        player: &Player,
    ) -> Vec<&'a Lobby> {
        let scorer = self.get_scorer(mode);
        lobbies
            .iter()
            .filter(|l| scorer.filter(l, player))
            .collect()
    }

    /// Returns the accepted lobby with the highest score, or `None` if the
    /// filter rejects every candidate. Ties keep the earliest candidate, so
    /// the store's descending retrieval order decides between equals.
    pub fn select_best<'a, I>(&self, mode: &str, lobbies: I, player: &Player) -> Option<&'a Lobby>
    where
        I: IntoIterator<Item = &'a Lobby>,
    {
        let scorer = self.get_scorer(mode);

        let mut best: Option<&Lobby> = None;
        let mut best_score = 0.0;

        for lobby in lobbies {
            if !scorer.filter(lobby, player) {
                continue;
            }

            let score = scorer.score(lobby, player);
            if best.is_none() || score > best_score {
                best = Some(lobby);
                best_score = score;
            }
        }

        best
    }
}
