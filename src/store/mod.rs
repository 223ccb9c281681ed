//! Row store gateway.
//!
//! One `PlayerRanking` row per player, plus the `top_k_players`
//! materialized projection used as the warm read tier. The engine is
//! written against the [`RankingStore`] contract; the Postgres
//! implementation backs production and the in-memory one backs tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgRankingStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{LeaderboardEntry, PlayerRanking};

/// Errors that can occur at the row store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Ranking row not found")]
    NotFound,

    #[error("Ranking row already exists for player {0}")]
    Conflict(i64),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence contract for player ranking rows and the top-K projection.
#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Insert a new row. Fails with [`StoreError::Conflict`] when a row for
    /// the player already exists.
    async fn create(&self, ranking: &PlayerRanking) -> Result<(), StoreError>;

    /// Full-row upsert keyed on `player_id`.
    async fn update(&self, ranking: &PlayerRanking) -> Result<(), StoreError>;

    /// Targeted combat-power override; bumps `last_battle_at` and
    /// `updated_at`, leaves the battle counters untouched.
    async fn update_combat_power(&self, player_id: i64, combat_power: i64)
        -> Result<(), StoreError>;

    /// Point lookup. [`StoreError::NotFound`] when the row is absent.
    async fn find_by_player_id(&self, player_id: i64) -> Result<PlayerRanking, StoreError>;

    /// Batch lookup. Rows come back in no particular order; absent ids are
    /// simply missing from the result.
    async fn find_by_player_ids(&self, player_ids: &[i64])
        -> Result<Vec<PlayerRanking>, StoreError>;

    /// Top N rows ordered by `(combat_power DESC, player_id ASC)`,
    /// excluding rows with no positive points.
    async fn find_top_n_by_combat_power(&self, limit: usize)
        -> Result<Vec<PlayerRanking>, StoreError>;

    /// The K-th highest combat power, or 0 when fewer than K rows exist.
    async fn kth_score(&self, k: usize) -> Result<i64, StoreError>;

    async fn total_player_count(&self) -> Result<i64, StoreError>;

    /// Number of rows with strictly greater combat power; used for
    /// rank-by-enumeration (`rank = count + 1`).
    async fn count_with_higher_power(&self, combat_power: i64) -> Result<i64, StoreError>;

    /// Remove a player's row. Absence is success.
    async fn delete(&self, player_id: i64) -> Result<(), StoreError>;

    /// Recompute the top-K materialized projection without blocking readers.
    async fn refresh_top_k_view(&self) -> Result<(), StoreError>;

    /// Top N entries off the projection, dense rank ascending.
    async fn find_top_n_from_view(&self, limit: usize)
        -> Result<Vec<LeaderboardEntry>, StoreError>;

    /// A player's dense rank in the projection, if present.
    async fn player_rank_from_view(&self, player_id: i64) -> Result<Option<i64>, StoreError>;
}
