//! In-memory ordered score index.
//!
//! The hot read tier: an ordered set of at most K members keyed on player
//! id and scored by combat power, plus per-player detail hashes, global
//! metadata keys, and the distributed sync lock. The engine is written
//! against the [`ScoreIndex`] contract; Redis backs production and the
//! in-memory implementation backs tests.

mod memory;
mod redis;

pub use memory::MemoryIndex;
pub use redis::RedisIndex;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{LeaderboardMetadata, PlayerRanking, PowerUpdateEvent};

pub const LEADERBOARD_KEY: &str = "leaderboard:global";
pub const THRESHOLD_KEY: &str = "leaderboard:threshold";
pub const TOTAL_PLAYERS_KEY: &str = "leaderboard:total_players";
pub const LAST_SYNC_KEY: &str = "leaderboard:last_sync";
pub const SYNC_LOCK_KEY: &str = "leaderboard:sync_lock";
pub const PLAYER_DETAILS_PREFIX: &str = "player:";
pub const POWER_UPDATES_CHANNEL: &str = "power.updates";

/// Errors that can occur at the index tier.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Failed to create cache pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    #[error("Cache pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Cache error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("Cache encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One member of the ordered score set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    pub player_id: i64,
    pub combat_power: i64,
}

/// Contract for the ordered score set, detail hashes, and metadata keys.
///
/// Set operations are individually atomic. The compound admission policy
/// (score check, upsert, trim, threshold recompute) lives in the engine;
/// races there are advisory because the periodic sync rebuilds exactly.
#[async_trait]
pub trait ScoreIndex: Send + Sync {
    /// Insert or update a member's score.
    async fn upsert(&self, player_id: i64, combat_power: i64) -> Result<(), IndexError>;

    async fn remove(&self, player_id: i64) -> Result<(), IndexError>;

    /// Retain only the K highest-scored members.
    async fn trim(&self, k: usize) -> Result<(), IndexError>;

    /// The n highest members, descending score.
    async fn top_n(&self, n: usize) -> Result<Vec<ScoredMember>, IndexError>;

    /// 1-indexed rank of a member, ties resolved by ascending player id.
    /// `None` when the member is not admitted.
    async fn rank_of(&self, player_id: i64) -> Result<Option<i64>, IndexError>;

    /// A member's score, 0 when absent.
    async fn score_of(&self, player_id: i64) -> Result<i64, IndexError>;

    /// The score at a 1-indexed rank, `None` past the end.
    async fn score_at_rank(&self, rank: usize) -> Result<Option<i64>, IndexError>;

    /// Members with rank in `[rank - ctx, rank + ctx]`, clamped to
    /// `[1, size]`, descending score.
    async fn window_around_rank(&self, rank: i64, ctx: i64)
        -> Result<Vec<ScoredMember>, IndexError>;

    async fn size(&self) -> Result<i64, IndexError>;

    /// Drop every member. Metadata and detail hashes are untouched.
    async fn clear(&self) -> Result<(), IndexError>;

    /// Pipelined bulk upsert used by the full rebuild.
    async fn batch_upsert(&self, members: &[ScoredMember]) -> Result<(), IndexError>;

    /// Write a player's denormalized detail hash (24 h TTL).
    async fn cache_details(&self, ranking: &PlayerRanking) -> Result<(), IndexError>;

    async fn get_details(&self, player_id: i64) -> Result<Option<PlayerRanking>, IndexError>;

    /// Pipelined batch read of detail hashes; absent players are missing
    /// from the result.
    async fn batch_get_details(
        &self,
        player_ids: &[i64],
    ) -> Result<HashMap<i64, PlayerRanking>, IndexError>;

    /// Current admission threshold, 0 when unset.
    async fn threshold(&self) -> Result<i64, IndexError>;

    async fn set_threshold(&self, threshold: i64) -> Result<(), IndexError>;

    /// Record the global metadata written by a completed sync.
    async fn set_sync_metadata(&self, total_players: i64) -> Result<(), IndexError>;

    /// Read the global metadata. `cache_hit` is left false; the engine
    /// flips it per read path.
    async fn metadata(&self) -> Result<LeaderboardMetadata, IndexError>;

    /// Set-if-absent with expiry; returns whether the caller now holds the
    /// sync lock.
    async fn acquire_sync_lock(&self, holder: &str) -> Result<bool, IndexError>;

    /// Release the sync lock, only if `holder` still owns it.
    async fn release_sync_lock(&self, holder: &str) -> Result<(), IndexError>;

    /// Fan out a power change on the internal pub/sub channel.
    async fn publish_power_update(&self, event: &PowerUpdateEvent) -> Result<(), IndexError>;
}

/// Key of a player's detail hash.
pub fn player_details_key(player_id: i64) -> String {
    format!("{PLAYER_DETAILS_PREFIX}{player_id}")
}
