//! Player ranking models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Multiplier turning authoritative points into the combat-power ranking key.
pub const COMBAT_POWER_MULTIPLIER: i64 = 100;

/// Combat power derived from a points total.
pub fn combat_power_for(total_points: i32) -> i64 {
    total_points as i64 * COMBAT_POWER_MULTIPLIER
}

/// A player's aggregate ranking state. One row per player; the owner of the
/// player's win/loss statistics and the authoritative points feed.
///
/// `rank` is never stored — it is computed on read from whichever tier
/// served the query.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlayerRanking {
    pub player_id: i64,

    /// Denormalized for display.
    pub username: String,

    /// Ranking key: `total_points * 100`.
    pub combat_power: i64,

    /// Authoritative score feed.
    pub total_points: i32,

    pub total_battles: i32,
    pub wins: i32,
    pub losses: i32,

    /// Percentage, derived: `wins / total_battles * 100`.
    pub win_rate: f64,

    pub last_battle_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlayerRanking {
    /// A fresh row for a player seen for the first time.
    pub fn new(player_id: i64, username: String, total_points: i32, now: DateTime<Utc>) -> Self {
        let mut ranking = Self {
            player_id,
            username,
            combat_power: 0,
            total_points,
            total_battles: 0,
            wins: 0,
            losses: 0,
            win_rate: 0.0,
            last_battle_at: None,
            created_at: now,
            updated_at: now,
        };
        ranking.recompute_derived();
        ranking
    }

    /// Record one battle outcome: adjust points, bump counters, stamp the
    /// battle time. Derived fields are recomputed.
    pub fn record_battle(&mut self, points_delta: i32, is_win: bool, now: DateTime<Utc>) {
        self.total_points += points_delta;
        self.total_battles += 1;
        if is_win {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.last_battle_at = Some(now);
        self.updated_at = now;
        self.recompute_derived();
    }

    /// Recompute `combat_power` and `win_rate` from the authoritative fields.
    pub fn recompute_derived(&mut self) {
        self.combat_power = combat_power_for(self.total_points);
        self.win_rate = if self.total_battles > 0 {
            self.wins as f64 / self.total_battles as f64 * 100.0
        } else {
            0.0
        };
    }
}

/// A `PlayerRanking` paired with its computed rank, as returned by the
/// single-player read endpoints. Rank 0 means "outside the admitted top-K".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedPlayer {
    pub rank: i64,
    #[serde(flatten)]
    pub ranking: PlayerRanking,
}

/// Transient read projection of one leaderboard position.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LeaderboardEntry {
    pub player_id: i64,
    pub username: String,
    pub combat_power: i64,
    pub total_points: i32,
    pub wins: i32,
    pub losses: i32,
    pub win_rate: f64,
    pub rank: i64,
    pub updated_at: DateTime<Utc>,
}

impl LeaderboardEntry {
    /// Project a ranking row to a leaderboard entry at the given rank.
    pub fn from_ranking(ranking: &PlayerRanking, rank: i64) -> Self {
        Self {
            player_id: ranking.player_id,
            username: ranking.username.clone(),
            combat_power: ranking.combat_power,
            total_points: ranking.total_points,
            wins: ranking.wins,
            losses: ranking.losses,
            win_rate: ranking.win_rate,
            rank,
            updated_at: ranking.updated_at,
        }
    }
}

/// Global leaderboard metadata attached to leaderboard reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderboardMetadata {
    pub total_players: i64,

    /// The K-th highest combat power currently admitted, 0 if fewer than K.
    pub top_k_threshold: i64,

    pub last_updated: Option<DateTime<Utc>>,

    /// Whether the hot tier served this read.
    pub cache_hit: bool,
}

/// A full leaderboard read: the entries plus global metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub leaderboard: Vec<LeaderboardEntry>,
    pub metadata: LeaderboardMetadata,
}

/// A player's rank together with the neighboring leaderboard window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRankContext {
    pub player: RankedPlayer,
    pub neighbors: Vec<LeaderboardEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combat_power_multiplier() {
        assert_eq!(combat_power_for(1060), 106_000);
        assert_eq!(combat_power_for(0), 0);
        assert_eq!(combat_power_for(-25), -2_500);
    }

    #[test]
    fn test_new_ranking_derives_fields() {
        let now = Utc::now();
        let ranking = PlayerRanking::new(1, "red".into(), 1000, now);

        assert_eq!(ranking.combat_power, 100_000);
        assert_eq!(ranking.total_battles, 0);
        assert_eq!(ranking.win_rate, 0.0);
        assert!(ranking.last_battle_at.is_none());
    }

    #[test]
    fn test_record_battle_win() {
        let now = Utc::now();
        let mut ranking = PlayerRanking::new(1, "red".into(), 1000, now);
        ranking.record_battle(60, true, now);

        assert_eq!(ranking.total_points, 1060);
        assert_eq!(ranking.combat_power, 106_000);
        assert_eq!(ranking.total_battles, 1);
        assert_eq!(ranking.wins, 1);
        assert_eq!(ranking.losses, 0);
        assert_eq!(ranking.win_rate, 100.0);
        assert_eq!(ranking.last_battle_at, Some(now));
    }

    #[test]
    fn test_record_battle_loss() {
        let now = Utc::now();
        let mut ranking = PlayerRanking::new(2, "blue".into(), 1000, now);
        ranking.record_battle(-25, false, now);

        assert_eq!(ranking.total_points, 975);
        assert_eq!(ranking.combat_power, 97_500);
        assert_eq!(ranking.wins, 0);
        assert_eq!(ranking.losses, 1);
        assert_eq!(ranking.win_rate, 0.0);
    }

    #[test]
    fn test_win_rate_mixed_record() {
        let now = Utc::now();
        let mut ranking = PlayerRanking::new(3, "green".into(), 1000, now);
        ranking.record_battle(10, true, now);
        ranking.record_battle(-10, false, now);
        ranking.record_battle(10, true, now);
        ranking.record_battle(10, true, now);

        assert_eq!(ranking.total_battles, 4);
        assert_eq!(ranking.wins + ranking.losses, ranking.total_battles);
        assert_eq!(ranking.win_rate, 75.0);
    }
}
