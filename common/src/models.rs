use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LobbyError {
    #[error("lobby is full")]
    Full,
}

/// A player waiting to be matched. `joined_at` is stamped when the player is
/// inserted into a lobby, not when the request arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub rating: i32,
    pub categories: Vec<i32>,
    pub joined_at: DateTime<Utc>,
}

impl Player {
    pub fn new(id: impl Into<String>, rating: i32, categories: Vec<i32>) -> Self {
        Self {
            id: id.into(),
            rating,
            categories,
            joined_at: Utc::now(),
        }
    }
}

/// A forming game instance shared through the store. Any node may mutate it
/// under the lobby's named mutex; `version` increases on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lobby {
    pub id: String,
    pub mode: String,
    pub categories: Vec<i32>,
    pub players: Vec<Player>,
    pub min_players: i16,
    pub max_players: i16,
    pub avg_rating: i32,
    pub created_at: DateTime<Utc>,
    pub last_joined_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub version: u16,
}

impl Lobby {
    pub fn new(
        id: impl Into<String>,
        mode: impl Into<String>,
        min_players: i16,
        max_players: i16,
        created_at: DateTime<Utc>,
        expire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            mode: mode.into(),
            categories: Vec::new(),
            players: Vec::new(),
            min_players,
            max_players,
            avg_rating: 0,
            created_at,
            last_joined_at: created_at,
            expire_at,
            version: 1,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players as usize
    }

    /// Insert a player, keeping `avg_rating`, `categories`, `last_joined_at`
    /// and `version` consistent. Re-inserting an id already in the lobby is a
    /// no-op success, so retried joins stay idempotent.
    pub fn add_player(&mut self, mut player: Player) -> Result<(), LobbyError> {
        if self.players.iter().any(|p| p.id == player.id) {
            return Ok(());
        }

        if self.is_full() {
            return Err(LobbyError::Full);
        }

        let now = Utc::now();
        player.joined_at = now;
        self.players.push(player);
        self.last_joined_at = now;
        self.recompute();
        self.bump_version();

        Ok(())
    }

    pub fn bump_version(&mut self) {
        self.version = self.version.saturating_add(1);
    }

    fn recompute(&mut self) {
        if self.players.is_empty() {
            self.avg_rating = 0;
            self.categories.clear();
            return;
        }

        let total: i64 = self.players.iter().map(|p| p.rating as i64).sum();
        self.avg_rating = (total / self.players.len() as i64) as i32;

        let union: BTreeSet<i32> = self
            .players
            .iter()
            .flat_map(|p| p.categories.iter().copied())
            .collect();
        self.categories = union.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby(min: i16, max: i16) -> Lobby {
        let now = Utc::now();
        Lobby::new("abc123def456", crate::modes::CLASSIC, min, max, now, now)
    }

    #[test]
    fn add_player_updates_aggregates() {
        let mut l = lobby(2, 4);
        l.add_player(Player::new("p1", 1000, vec![1, 2])).unwrap();
        l.add_player(Player::new("p2", 1500, vec![2, 3])).unwrap();

        assert_eq!(l.player_count(), 2);
        assert_eq!(l.avg_rating, 1250);
        assert_eq!(l.categories, vec![1, 2, 3]);
        assert_eq!(l.version, 3);
    }

    #[test]
    fn add_player_fails_when_full() {
        let mut l = lobby(2, 2);
        l.add_player(Player::new("p1", 100, vec![1])).unwrap();
        l.add_player(Player::new("p2", 100, vec![1])).unwrap();

        assert_eq!(
            l.add_player(Player::new("p3", 100, vec![1])),
            Err(LobbyError::Full)
        );
        assert_eq!(l.player_count(), 2);
    }

    #[test]
    fn add_player_is_idempotent_per_id() {
        let mut l = lobby(2, 4);
        l.add_player(Player::new("p1", 900, vec![5])).unwrap();
        let version = l.version;

        l.add_player(Player::new("p1", 900, vec![5])).unwrap();
        assert_eq!(l.player_count(), 1);
        assert_eq!(l.version, version);
    }

    #[test]
    fn add_player_stamps_join_time_and_advances_last_joined() {
        let mut l = lobby(1, 4);
        let before = l.last_joined_at;
        let stale = Player {
            joined_at: Utc::now() - chrono::Duration::hours(1),
            ..Player::new("p1", 100, vec![])
        };
        l.add_player(stale).unwrap();

        assert!(l.players[0].joined_at > before - chrono::Duration::seconds(1));
        assert!(l.last_joined_at >= before);
    }

    #[test]
    fn average_uses_integer_division() {
        let mut l = lobby(1, 8);
        l.add_player(Player::new("p1", 100, vec![])).unwrap();
        l.add_player(Player::new("p2", 101, vec![])).unwrap();
        assert_eq!(l.avg_rating, 100);
    }
}
