//! The ranking engine.
//!
//! Orchestrates battle outcomes across the row store and the score index,
//! and serves reads with a strict tier fallback order: index, materialized
//! projection, row store. Holds no in-process lock across I/O; per-player
//! write safety comes from single-consumer ordering on the queue plus
//! last-write-wins on the row's natural key.

mod sync;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::fetch::{BattleLog, FetchError, PlayerDirectory};
use crate::index::{IndexError, ScoreIndex, ScoredMember};
use crate::models::{
    Leaderboard, LeaderboardEntry, LeaderboardMetadata, PlayerRanking, PlayerRankContext,
    PowerUpdateEvent, RankedPlayer,
};
use crate::store::{RankingStore, StoreError};

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Player ranking not found")]
    NotFound,

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Ranking sync already running")]
    LockBusy,

    #[error("Upstream service failed: {0}")]
    Upstream(#[from] FetchError),

    #[error("Storage failure: {0}")]
    Store(StoreError),

    #[error("Index failure: {0}")]
    Index(#[from] IndexError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => EngineError::NotFound,
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    /// Whether redelivery can plausibly succeed. The consumer nacks
    /// transient failures and acks everything else.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::Index(_))
    }
}

fn clamp_limit(limit: Option<i64>) -> usize {
    limit.unwrap_or(100).clamp(1, 10_000) as usize
}

fn clamp_context(ctx: Option<i64>) -> i64 {
    ctx.unwrap_or(5).clamp(1, 50)
}

/// The orchestrator. Written against the store/index/fetcher contracts
/// only, so the whole battery of behavior tests runs on in-memory fakes.
pub struct RankingEngine {
    store: Arc<dyn RankingStore>,
    index: Arc<dyn ScoreIndex>,
    players: Arc<dyn PlayerDirectory>,
    battles: Arc<dyn BattleLog>,
    top_k: usize,
    instance_id: String,
}

impl RankingEngine {
    pub fn new(
        store: Arc<dyn RankingStore>,
        index: Arc<dyn ScoreIndex>,
        players: Arc<dyn PlayerDirectory>,
        battles: Arc<dyn BattleLog>,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            index,
            players,
            battles,
            top_k,
            instance_id: format!("instance-{}", Uuid::new_v4()),
        }
    }

    /// Apply one completed battle: winner first, then loser. An upstream
    /// failure on one side skips that side only; storage failures bubble so
    /// the consumer can redeliver.
    pub async fn apply_battle_outcome(
        &self,
        winner_id: i64,
        loser_id: i64,
        points_won: i32,
        points_lost: i32,
    ) -> Result<(), EngineError> {
        if winner_id <= 0 || loser_id <= 0 {
            return Err(EngineError::Validation(
                "player ids must be positive".into(),
            ));
        }
        if winner_id == loser_id {
            return Err(EngineError::Validation(
                "winner and loser must differ".into(),
            ));
        }

        let sides = [
            (winner_id, points_won, true),
            (loser_id, -points_lost, false),
        ];
        for (player_id, delta, is_win) in sides {
            match self.apply_player_outcome(player_id, delta, is_win).await {
                Ok(()) => {}
                Err(EngineError::Upstream(err)) => {
                    warn!(player_id, error = %err, "Skipping ranking update for unavailable player");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Update one player's row for one battle outcome, then push the new
    /// combat power through the index admission policy.
    async fn apply_player_outcome(
        &self,
        player_id: i64,
        delta: i32,
        is_win: bool,
    ) -> Result<(), EngineError> {
        let now = Utc::now();

        let ranking = match self.store.find_by_player_id(player_id).await {
            Ok(mut row) => {
                row.record_battle(delta, is_win, now);
                self.store.update(&row).await?;
                row
            }
            Err(StoreError::NotFound) => {
                // First battle we have seen for this player: pull the
                // authoritative baseline, then fold in this outcome.
                let player = self.players.fetch_player(player_id).await?;
                let mut row =
                    PlayerRanking::new(player_id, player.username, player.points + delta, now);
                row.total_battles = 1;
                if is_win {
                    row.wins = 1;
                } else {
                    row.losses = 1;
                }
                row.last_battle_at = Some(now);
                row.recompute_derived();

                match self.store.create(&row).await {
                    Ok(()) => {}
                    // Lost a create race; the row exists now, overwrite it.
                    Err(StoreError::Conflict(_)) => self.store.update(&row).await?,
                    Err(err) => return Err(err.into()),
                }
                row
            }
            Err(err) => return Err(err.into()),
        };

        // Index and detail-cache writes are best effort; the periodic sync
        // rebuilds both exactly.
        if let Err(err) = self.admit(player_id, ranking.combat_power).await {
            warn!(player_id, error = %err, "Index admission failed");
        }
        if let Err(err) = self.index.cache_details(&ranking).await {
            warn!(player_id, error = %err, "Detail cache refresh failed");
        }

        let event = PowerUpdateEvent {
            player_id,
            username: ranking.username.clone(),
            combat_power: ranking.combat_power,
            points_delta: delta,
            is_win,
            timestamp: now,
        };
        if let Err(err) = self.index.publish_power_update(&event).await {
            warn!(player_id, error = %err, "Power update publish failed");
        }

        Ok(())
    }

    /// Direct combat-power override for admin callers. Touches neither the
    /// points feed nor the battle counters.
    pub async fn update_combat_power(
        &self,
        player_id: i64,
        combat_power: i64,
    ) -> Result<(), EngineError> {
        if player_id <= 0 || combat_power < 0 {
            return Err(EngineError::Validation(
                "invalid player id or combat power".into(),
            ));
        }

        self.store
            .update_combat_power(player_id, combat_power)
            .await?;
        self.admit(player_id, combat_power).await?;

        let row = self.store.find_by_player_id(player_id).await?;
        if let Err(err) = self.index.cache_details(&row).await {
            warn!(player_id, error = %err, "Detail cache refresh failed");
        }
        Ok(())
    }

    /// The index admission policy: non-positive scores are evicted; a score
    /// at or above the threshold (or any score while the index is not full)
    /// is admitted, the set trimmed back to K, and the threshold recomputed.
    async fn admit(&self, player_id: i64, combat_power: i64) -> Result<(), IndexError> {
        if combat_power <= 0 {
            return self.index.remove(player_id).await;
        }

        let threshold = self.index.threshold().await?;
        let size = self.index.size().await? as usize;
        if size >= self.top_k && combat_power < threshold {
            // Below the bar; the row store still carries the update.
            return Ok(());
        }

        self.index.upsert(player_id, combat_power).await?;
        self.index.trim(self.top_k).await?;

        let new_threshold = if self.index.size().await? as usize >= self.top_k {
            self.index.score_at_rank(self.top_k).await?.unwrap_or(0)
        } else {
            0
        };
        self.index.set_threshold(new_threshold).await
    }

    /// Global top-N read. Tier order: index, materialized projection, row
    /// store. Content is identical regardless of the serving tier.
    pub async fn get_leaderboard(&self, limit: Option<i64>) -> Result<Leaderboard, EngineError> {
        let limit = clamp_limit(limit);

        match self.index.top_n(limit).await {
            Ok(members) if !members.is_empty() => {
                let leaderboard = self.enrich_members(&members, 1).await?;
                let mut metadata = self.read_metadata().await;
                metadata.cache_hit = true;
                return Ok(Leaderboard {
                    leaderboard,
                    metadata,
                });
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Index tier unavailable, falling back"),
        }

        match self.store.find_top_n_from_view(limit).await {
            Ok(entries) if !entries.is_empty() => {
                let mut metadata = self.read_metadata().await;
                metadata.cache_hit = true;
                return Ok(Leaderboard {
                    leaderboard: entries,
                    metadata,
                });
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Materialized view unavailable, falling back"),
        }

        let rows = self.store.find_top_n_by_combat_power(limit).await?;
        let leaderboard = rows
            .iter()
            .enumerate()
            .map(|(i, row)| LeaderboardEntry::from_ranking(row, i as i64 + 1))
            .collect();
        Ok(Leaderboard {
            leaderboard,
            metadata: self.read_metadata().await,
        })
    }

    /// A single player's row with its computed rank.
    pub async fn get_player_ranking(&self, player_id: i64) -> Result<RankedPlayer, EngineError> {
        if player_id <= 0 {
            return Err(EngineError::Validation("invalid player id".into()));
        }

        // Hot path: detail hash plus index rank, no row-store touch.
        if let Ok(Some(details)) = self.index.get_details(player_id).await {
            if let Ok(Some(rank)) = self.index.rank_of(player_id).await {
                return Ok(RankedPlayer {
                    rank,
                    ranking: details,
                });
            }
        }

        let ranking = self.store.find_by_player_id(player_id).await?;
        let rank = match self.index.rank_of(player_id).await {
            Ok(Some(rank)) => rank,
            _ => match self.store.player_rank_from_view(player_id).await {
                Ok(Some(rank)) => rank,
                _ => {
                    self.store
                        .count_with_higher_power(ranking.combat_power)
                        .await?
                        + 1
                }
            },
        };

        Ok(RankedPlayer { rank, ranking })
    }

    /// A player's rank with the surrounding leaderboard window. Players
    /// outside the admitted top-K come back with rank 0 and no neighbors.
    pub async fn get_player_rank_with_context(
        &self,
        player_id: i64,
        ctx: Option<i64>,
    ) -> Result<PlayerRankContext, EngineError> {
        if player_id <= 0 {
            return Err(EngineError::Validation("invalid player id".into()));
        }
        let ctx = clamp_context(ctx);

        let rank = self.index.rank_of(player_id).await.ok().flatten();
        match rank {
            Some(rank) => {
                let window = self.index.window_around_rank(rank, ctx).await?;
                let first_rank = (rank - ctx).max(1);
                let neighbors = self.enrich_members(&window, first_rank).await?;
                let ranking = self.player_row(player_id).await?;
                Ok(PlayerRankContext {
                    player: RankedPlayer { rank, ranking },
                    neighbors,
                })
            }
            None => {
                let ranking = self.store.find_by_player_id(player_id).await?;
                Ok(PlayerRankContext {
                    player: RankedPlayer { rank: 0, ranking },
                    neighbors: Vec::new(),
                })
            }
        }
    }

    /// Remove a player from both tiers. Absence is success.
    pub async fn delete_player_ranking(&self, player_id: i64) -> Result<(), EngineError> {
        if player_id <= 0 {
            return Err(EngineError::Validation("invalid player id".into()));
        }
        self.index.remove(player_id).await?;
        self.store.delete(player_id).await?;
        Ok(())
    }

    async fn player_row(&self, player_id: i64) -> Result<PlayerRanking, EngineError> {
        if let Ok(Some(details)) = self.index.get_details(player_id).await {
            return Ok(details);
        }
        Ok(self.store.find_by_player_id(player_id).await?)
    }

    /// Turn raw index members into enriched leaderboard entries with dense
    /// ranks starting at `first_rank`. Details come from the hash cache,
    /// with a row-store backfill for misses.
    async fn enrich_members(
        &self,
        members: &[ScoredMember],
        first_rank: i64,
    ) -> Result<Vec<LeaderboardEntry>, EngineError> {
        let mut sorted = members.to_vec();
        sorted.sort_by(|a, b| {
            b.combat_power
                .cmp(&a.combat_power)
                .then(a.player_id.cmp(&b.player_id))
        });

        let ids: Vec<i64> = sorted.iter().map(|m| m.player_id).collect();
        let mut details = self.index.batch_get_details(&ids).await.unwrap_or_default();

        let missing: Vec<i64> = ids
            .iter()
            .filter(|id| !details.contains_key(id))
            .copied()
            .collect();
        if !missing.is_empty() {
            for row in self.store.find_by_player_ids(&missing).await? {
                if let Err(err) = self.index.cache_details(&row).await {
                    warn!(player_id = row.player_id, error = %err, "Detail cache backfill failed");
                }
                details.insert(row.player_id, row);
            }
        }

        let mut entries = Vec::with_capacity(sorted.len());
        let mut rank = first_rank;
        for member in &sorted {
            if let Some(row) = details.get(&member.player_id) {
                let mut entry = LeaderboardEntry::from_ranking(row, rank);
                // The index score is the key this read was ordered by.
                entry.combat_power = member.combat_power;
                entries.push(entry);
                rank += 1;
            }
        }
        Ok(entries)
    }

    async fn read_metadata(&self) -> LeaderboardMetadata {
        let mut metadata = self.index.metadata().await.unwrap_or_default();
        if metadata.total_players == 0 {
            if let Ok(count) = self.store.total_player_count().await {
                metadata.total_players = count;
            }
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::index::MemoryIndex;
    use crate::models::{Battle, Player};
    use crate::store::MemoryStore;

    struct StaticPlayers(Mutex<HashMap<i64, Player>>);

    impl StaticPlayers {
        fn new(entries: &[(i64, &str, i32)]) -> Self {
            let players = entries
                .iter()
                .map(|(id, username, points)| {
                    (
                        *id,
                        Player {
                            id: *id,
                            username: username.to_string(),
                            points: *points,
                        },
                    )
                })
                .collect();
            Self(Mutex::new(players))
        }
    }

    #[async_trait]
    impl PlayerDirectory for StaticPlayers {
        async fn fetch_player(&self, player_id: i64) -> Result<Player, FetchError> {
            self.0
                .lock()
                .unwrap()
                .get(&player_id)
                .cloned()
                .ok_or(FetchError::PlayerNotFound(player_id))
        }

        async fn fetch_all_players(&self) -> Result<Vec<Player>, FetchError> {
            let mut players: Vec<Player> = self.0.lock().unwrap().values().cloned().collect();
            players.sort_by_key(|p| p.id);
            Ok(players)
        }
    }

    struct StaticBattles(Vec<Battle>);

    #[async_trait]
    impl BattleLog for StaticBattles {
        async fn fetch_completed_battles(&self) -> Result<Vec<Battle>, FetchError> {
            Ok(self
                .0
                .iter()
                .filter(|b| b.is_completed())
                .cloned()
                .collect())
        }
    }

    struct Harness {
        engine: RankingEngine,
        store: Arc<MemoryStore>,
        index: Arc<MemoryIndex>,
    }

    fn harness(top_k: usize, players: &[(i64, &str, i32)]) -> Harness {
        harness_with_battles(top_k, players, Vec::new())
    }

    fn harness_with_battles(
        top_k: usize,
        players: &[(i64, &str, i32)],
        battles: Vec<Battle>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let engine = RankingEngine::new(
            store.clone(),
            index.clone(),
            Arc::new(StaticPlayers::new(players)),
            Arc::new(StaticBattles(battles)),
            top_k,
        );
        Harness {
            engine,
            store,
            index,
        }
    }

    async fn seed_row(store: &MemoryStore, player_id: i64, points: i32) {
        let row = PlayerRanking::new(player_id, format!("player-{player_id}"), points, Utc::now());
        store.create(&row).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_self_battle_and_bad_ids() {
        let h = harness(10, &[]);

        let err = h.engine.apply_battle_outcome(3, 3, 10, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = h.engine.apply_battle_outcome(0, 3, 10, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cold_start_single_battle() {
        let h = harness(10_000, &[(1, "red", 1000), (2, "blue", 1000)]);

        h.engine.apply_battle_outcome(1, 2, 60, 25).await.unwrap();

        let winner = h.store.find_by_player_id(1).await.unwrap();
        assert_eq!(winner.total_points, 1060);
        assert_eq!(winner.combat_power, 106_000);
        assert_eq!(winner.wins, 1);
        assert_eq!(winner.losses, 0);
        assert_eq!(winner.win_rate, 100.0);

        let loser = h.store.find_by_player_id(2).await.unwrap();
        assert_eq!(loser.total_points, 975);
        assert_eq!(loser.combat_power, 97_500);
        assert_eq!(loser.wins, 0);
        assert_eq!(loser.losses, 1);
        assert_eq!(loser.win_rate, 0.0);

        let board = h.engine.get_leaderboard(Some(2)).await.unwrap();
        assert!(board.metadata.cache_hit);
        assert_eq!(board.leaderboard.len(), 2);
        assert_eq!(board.leaderboard[0].player_id, 1);
        assert_eq!(board.leaderboard[0].rank, 1);
        assert_eq!(board.leaderboard[1].player_id, 2);
        assert_eq!(board.leaderboard[1].rank, 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_increments_counters() {
        // The wire format carries no dedup key: replaying a delivery is a
        // second battle as far as the engine is concerned.
        let h = harness(10_000, &[(1, "red", 1000), (2, "blue", 1000)]);

        h.engine.apply_battle_outcome(1, 2, 60, 25).await.unwrap();
        h.engine.apply_battle_outcome(1, 2, 60, 25).await.unwrap();

        let winner = h.store.find_by_player_id(1).await.unwrap();
        assert_eq!(winner.total_points, 1120);
        assert_eq!(winner.total_battles, 2);
        assert_eq!(winner.wins, 2);
    }

    #[tokio::test]
    async fn test_tie_break_determinism() {
        let h = harness(10_000, &[]);
        seed_row(&h.store, 42, 1000).await;
        seed_row(&h.store, 7, 1000).await;
        h.engine.sync_rankings().await.unwrap();

        let lower = h.engine.get_player_ranking(7).await.unwrap();
        assert_eq!(lower.rank, 1);
        let higher = h.engine.get_player_ranking(42).await.unwrap();
        assert_eq!(higher.rank, 2);

        let board = h.engine.get_leaderboard(Some(2)).await.unwrap();
        let ids: Vec<i64> = board.leaderboard.iter().map(|e| e.player_id).collect();
        assert_eq!(ids, vec![7, 42]);
    }

    #[tokio::test]
    async fn test_threshold_admission_evicts_kth() {
        let h = harness(3, &[]);
        for (id, points) in [(1, 500), (2, 400), (3, 300), (4, 100)] {
            seed_row(&h.store, id, points).await;
        }
        h.engine.sync_rankings().await.unwrap();
        assert_eq!(h.index.threshold().await.unwrap(), 30_000);

        // Player 4 climbs from 100 to 350 points: past the bar, evicting
        // the current K-th member.
        h.engine.apply_battle_outcome(4, 1, 250, 0).await.unwrap();

        let top = h.index.top_n(10).await.unwrap();
        let scores: Vec<i64> = top.iter().map(|m| m.combat_power).collect();
        assert_eq!(scores, vec![50_000, 40_000, 35_000]);
        assert_eq!(h.index.rank_of(3).await.unwrap(), None);
        assert_eq!(h.index.threshold().await.unwrap(), 35_000);
    }

    #[tokio::test]
    async fn test_below_threshold_write_skips_index() {
        let h = harness(3, &[]);
        for (id, points) in [(1, 500), (2, 400), (3, 300), (4, 100)] {
            seed_row(&h.store, id, points).await;
        }
        h.engine.sync_rankings().await.unwrap();

        // 100 -> 150 points stays below the 300-point bar.
        h.engine.apply_battle_outcome(4, 1, 50, 0).await.unwrap();

        assert_eq!(h.index.rank_of(4).await.unwrap(), None);
        assert_eq!(h.index.size().await.unwrap(), 3);
        // The row store still carries the update.
        let row = h.store.find_by_player_id(4).await.unwrap();
        assert_eq!(row.total_points, 150);
    }

    #[tokio::test]
    async fn test_fallback_tiers_serve_identical_content() {
        let h = harness(10_000, &[]);
        for (id, points) in [(1, 500), (2, 400), (3, 300)] {
            seed_row(&h.store, id, points).await;
        }
        h.engine.sync_rankings().await.unwrap();
        h.engine.refresh_materialized_view().await.unwrap();

        let from_index = h.engine.get_leaderboard(Some(10)).await.unwrap();
        assert!(from_index.metadata.cache_hit);

        // Flush the index: the materialized view serves next.
        h.index.clear().await.unwrap();
        let from_view = h.engine.get_leaderboard(Some(10)).await.unwrap();
        assert!(from_view.metadata.cache_hit);

        // A cold harness with neither index nor view falls to the row store.
        let cold = harness(10_000, &[]);
        for (id, points) in [(1, 500), (2, 400), (3, 300)] {
            seed_row(&cold.store, id, points).await;
        }
        let from_rows = cold.engine.get_leaderboard(Some(10)).await.unwrap();
        assert!(!from_rows.metadata.cache_hit);

        for board in [&from_index, &from_view, &from_rows] {
            let content: Vec<(i64, i64, i64)> = board
                .leaderboard
                .iter()
                .map(|e| (e.rank, e.player_id, e.combat_power))
                .collect();
            assert_eq!(
                content,
                vec![(1, 1, 50_000), (2, 2, 40_000), (3, 3, 30_000)]
            );
        }
    }

    #[tokio::test]
    async fn test_player_deletion_is_idempotent() {
        let h = harness(10_000, &[(7, "red", 1000), (8, "blue", 1000)]);
        h.engine.apply_battle_outcome(7, 8, 60, 25).await.unwrap();

        h.engine.delete_player_ranking(7).await.unwrap();
        assert!(matches!(
            h.engine.get_player_ranking(7).await,
            Err(EngineError::NotFound)
        ));
        assert_eq!(h.index.rank_of(7).await.unwrap(), None);

        // Re-delivery of the same deletion is a no-op.
        h.engine.delete_player_ranking(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_lock_mutual_exclusion() {
        let h = harness(10_000, &[]);
        seed_row(&h.store, 1, 500).await;

        assert!(h.index.acquire_sync_lock("other-instance").await.unwrap());
        assert!(matches!(
            h.engine.sync_rankings().await,
            Err(EngineError::LockBusy)
        ));
        // The foreign lock survives the failed attempt.
        assert!(!h.index.acquire_sync_lock("third").await.unwrap());

        h.index.release_sync_lock("other-instance").await.unwrap();
        h.engine.sync_rankings().await.unwrap();
        // The engine released its own lock on the way out.
        h.engine.sync_rankings().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let h = harness(10_000, &[]);
        for (id, points) in [(1, 500), (2, 400), (3, 300)] {
            seed_row(&h.store, id, points).await;
        }

        h.engine.sync_rankings().await.unwrap();
        let first = h.index.top_n(10).await.unwrap();
        h.engine.sync_rankings().await.unwrap();
        let second = h.index.top_n(10).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.index.threshold().await.unwrap(), 0); // fewer than K members
    }

    #[tokio::test]
    async fn test_upstream_failure_skips_one_side_only() {
        // Player 99 is unknown to the player service; the winner update
        // still lands and the event is accepted.
        let h = harness(10_000, &[(1, "red", 1000)]);

        h.engine.apply_battle_outcome(1, 99, 60, 25).await.unwrap();

        let winner = h.store.find_by_player_id(1).await.unwrap();
        assert_eq!(winner.wins, 1);
        assert!(matches!(
            h.store.find_by_player_id(99).await,
            Err(crate::store::StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_update_combat_power_override() {
        let h = harness(10_000, &[(1, "red", 1000), (2, "blue", 1000)]);
        h.engine.apply_battle_outcome(1, 2, 60, 25).await.unwrap();

        h.engine.update_combat_power(2, 999_000).await.unwrap();

        let row = h.store.find_by_player_id(2).await.unwrap();
        assert_eq!(row.combat_power, 999_000);
        // Counters are untouched by the override.
        assert_eq!(row.total_battles, 1);
        assert_eq!(row.losses, 1);
        assert_eq!(h.index.rank_of(2).await.unwrap(), Some(1));

        let err = h.engine.update_combat_power(2, -5).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_rank_with_context_window() {
        let h = harness(10_000, &[]);
        for id in 1..=10 {
            seed_row(&h.store, id, 1000 - id as i32).await;
        }
        h.engine.sync_rankings().await.unwrap();

        let ctx = h.engine.get_player_rank_with_context(5, Some(2)).await.unwrap();
        assert_eq!(ctx.player.rank, 5);
        let ranks: Vec<i64> = ctx.neighbors.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![3, 4, 5, 6, 7]);
        let ids: Vec<i64> = ctx.neighbors.iter().map(|e| e.player_id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_rank_with_context_outside_index() {
        let h = harness(2, &[]);
        for (id, points) in [(1, 500), (2, 400), (3, 300)] {
            seed_row(&h.store, id, points).await;
        }
        h.engine.sync_rankings().await.unwrap();

        // Player 3 is tracked but below the K=2 bar.
        let ctx = h.engine.get_player_rank_with_context(3, None).await.unwrap();
        assert_eq!(ctx.player.rank, 0);
        assert!(ctx.neighbors.is_empty());
        assert_eq!(ctx.player.ranking.player_id, 3);
    }

    #[tokio::test]
    async fn test_invariants_hold_after_event_sequence() {
        let top_k = 2;
        let h = harness(
            top_k,
            &[(1, "a", 1000), (2, "b", 1000), (3, "c", 1000), (4, "d", 1000)],
        );

        for (winner, loser) in [(1, 2), (3, 4), (1, 3), (2, 4), (4, 1)] {
            h.engine
                .apply_battle_outcome(winner, loser, 30, 20)
                .await
                .unwrap();
        }

        for id in 1..=4 {
            let row = h.store.find_by_player_id(id).await.unwrap();
            assert_eq!(row.wins + row.losses, row.total_battles);
            assert_eq!(row.combat_power, row.total_points as i64 * 100);
        }
        assert!(h.index.size().await.unwrap() <= top_k as i64);

        h.engine.sync_rankings().await.unwrap();
        // After a sync the index mirrors the row store exactly and the
        // threshold equals the K-th admitted score.
        let top = h.index.top_n(top_k).await.unwrap();
        for member in &top {
            let row = h.store.find_by_player_id(member.player_id).await.unwrap();
            assert_eq!(member.combat_power, row.combat_power);
        }
        let kth = h.index.score_at_rank(top_k).await.unwrap().unwrap_or(0);
        assert_eq!(h.index.threshold().await.unwrap(), kth);
    }

    #[tokio::test]
    async fn test_power_update_published_per_side() {
        let h = harness(10_000, &[(1, "red", 1000), (2, "blue", 1000)]);
        h.engine.apply_battle_outcome(1, 2, 60, 25).await.unwrap();

        let events = h.index.published_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].player_id, 1);
        assert!(events[0].is_win);
        assert_eq!(events[0].points_delta, 60);
        assert_eq!(events[1].player_id, 2);
        assert!(!events[1].is_win);
        assert_eq!(events[1].points_delta, -25);
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_and_replays_once() {
        let battles = vec![
            Battle {
                id: 1,
                player1_id: 1,
                player2_id: 2,
                winner_id: 1,
                status: "completed".into(),
                points_won: 60,
                points_lost: 25,
                completed_at: None,
            },
            Battle {
                id: 2,
                player1_id: 1,
                player2_id: 2,
                winner_id: 0,
                status: "pending".into(),
                points_won: 0,
                points_lost: 0,
                completed_at: None,
            },
        ];
        let h = harness_with_battles(10_000, &[(1, "red", 1000), (2, "blue", 900)], battles);

        h.engine.bootstrap_from_external_services().await.unwrap();

        // Stats-only replay: points stay at the authoritative baseline.
        let p1 = h.store.find_by_player_id(1).await.unwrap();
        assert_eq!(p1.total_points, 1000);
        assert_eq!(p1.wins, 1);
        assert_eq!(p1.total_battles, 1);
        let p2 = h.store.find_by_player_id(2).await.unwrap();
        assert_eq!(p2.total_points, 900);
        assert_eq!(p2.losses, 1);

        // Re-running does not double-count.
        h.engine.bootstrap_from_external_services().await.unwrap();
        let p1 = h.store.find_by_player_id(1).await.unwrap();
        assert_eq!(p1.total_battles, 1);

        // The post-bootstrap sync primed the index.
        assert_eq!(h.index.rank_of(1).await.unwrap(), Some(1));
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 100);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(50)), 50);
        assert_eq!(clamp_limit(Some(99_999)), 10_000);
    }

    #[test]
    fn test_clamp_context() {
        assert_eq!(clamp_context(None), 5);
        assert_eq!(clamp_context(Some(0)), 1);
        assert_eq!(clamp_context(Some(12)), 12);
        assert_eq!(clamp_context(Some(500)), 50);
    }
}
