//! In-memory score index used by the engine tests.
//!
//! Ordering is exact: descending combat power, ties by ascending player
//! id. Detail hashes ignore TTL; the sync lock honors its expiry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{IndexError, ScoreIndex, ScoredMember};
use crate::config::SYNC_LOCK_TIMEOUT;
use crate::models::{LeaderboardMetadata, PlayerRanking, PowerUpdateEvent};

#[derive(Default)]
struct State {
    /// `(Reverse(score), player_id)` so natural order is score-descending,
    /// id-ascending.
    ordered: BTreeSet<(std::cmp::Reverse<i64>, i64)>,
    scores: HashMap<i64, i64>,
    details: HashMap<i64, PlayerRanking>,
    threshold: i64,
    total_players: i64,
    last_sync: Option<DateTime<Utc>>,
    lock: Option<(String, Instant)>,
    published: Vec<PowerUpdateEvent>,
}

#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Power-update events published so far, for test assertions.
    pub fn published_events(&self) -> Vec<PowerUpdateEvent> {
        self.state.lock().unwrap().published.clone()
    }
}

impl State {
    fn insert(&mut self, player_id: i64, combat_power: i64) {
        if let Some(old) = self.scores.insert(player_id, combat_power) {
            self.ordered.remove(&(std::cmp::Reverse(old), player_id));
        }
        self.ordered
            .insert((std::cmp::Reverse(combat_power), player_id));
    }

    fn drop_member(&mut self, player_id: i64) {
        if let Some(old) = self.scores.remove(&player_id) {
            self.ordered.remove(&(std::cmp::Reverse(old), player_id));
        }
    }

    fn members(&self) -> impl Iterator<Item = ScoredMember> + '_ {
        self.ordered.iter().map(|(score, id)| ScoredMember {
            player_id: *id,
            combat_power: score.0,
        })
    }
}

#[async_trait]
impl ScoreIndex for MemoryIndex {
    async fn upsert(&self, player_id: i64, combat_power: i64) -> Result<(), IndexError> {
        self.state.lock().unwrap().insert(player_id, combat_power);
        Ok(())
    }

    async fn remove(&self, player_id: i64) -> Result<(), IndexError> {
        self.state.lock().unwrap().drop_member(player_id);
        Ok(())
    }

    async fn trim(&self, k: usize) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        let evicted: Vec<i64> = state.members().skip(k).map(|m| m.player_id).collect();
        for id in evicted {
            state.drop_member(id);
        }
        Ok(())
    }

    async fn top_n(&self, n: usize) -> Result<Vec<ScoredMember>, IndexError> {
        let state = self.state.lock().unwrap();
        Ok(state.members().take(n).collect())
    }

    async fn rank_of(&self, player_id: i64) -> Result<Option<i64>, IndexError> {
        let state = self.state.lock().unwrap();
        let result = state
            .members()
            .position(|m| m.player_id == player_id)
            .map(|p| p as i64 + 1);
        Ok(result)
    }

    async fn score_of(&self, player_id: i64) -> Result<i64, IndexError> {
        let state = self.state.lock().unwrap();
        Ok(state.scores.get(&player_id).copied().unwrap_or(0))
    }

    async fn score_at_rank(&self, rank: usize) -> Result<Option<i64>, IndexError> {
        if rank == 0 {
            return Ok(None);
        }
        let state = self.state.lock().unwrap();
        let result = state.members().nth(rank - 1).map(|m| m.combat_power);
        Ok(result)
    }

    async fn window_around_rank(
        &self,
        rank: i64,
        ctx: i64,
    ) -> Result<Vec<ScoredMember>, IndexError> {
        let state = self.state.lock().unwrap();
        let size = state.scores.len() as i64;
        if size == 0 {
            return Ok(Vec::new());
        }
        let start = (rank - ctx).max(1);
        let end = (rank + ctx).min(size);
        Ok(state
            .members()
            .skip(start as usize - 1)
            .take((end - start + 1) as usize)
            .collect())
    }

    async fn size(&self) -> Result<i64, IndexError> {
        Ok(self.state.lock().unwrap().scores.len() as i64)
    }

    async fn clear(&self) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        state.ordered.clear();
        state.scores.clear();
        Ok(())
    }

    async fn batch_upsert(&self, members: &[ScoredMember]) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        for m in members {
            state.insert(m.player_id, m.combat_power);
        }
        Ok(())
    }

    async fn cache_details(&self, ranking: &PlayerRanking) -> Result<(), IndexError> {
        self.state
            .lock()
            .unwrap()
            .details
            .insert(ranking.player_id, ranking.clone());
        Ok(())
    }

    async fn get_details(&self, player_id: i64) -> Result<Option<PlayerRanking>, IndexError> {
        Ok(self.state.lock().unwrap().details.get(&player_id).cloned())
    }

    async fn batch_get_details(
        &self,
        player_ids: &[i64],
    ) -> Result<HashMap<i64, PlayerRanking>, IndexError> {
        let state = self.state.lock().unwrap();
        Ok(player_ids
            .iter()
            .filter_map(|id| state.details.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn threshold(&self) -> Result<i64, IndexError> {
        Ok(self.state.lock().unwrap().threshold)
    }

    async fn set_threshold(&self, threshold: i64) -> Result<(), IndexError> {
        self.state.lock().unwrap().threshold = threshold;
        Ok(())
    }

    async fn set_sync_metadata(&self, total_players: i64) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        state.total_players = total_players;
        state.last_sync = Some(Utc::now());
        Ok(())
    }

    async fn metadata(&self) -> Result<LeaderboardMetadata, IndexError> {
        let state = self.state.lock().unwrap();
        Ok(LeaderboardMetadata {
            total_players: state.total_players,
            top_k_threshold: state.threshold,
            last_updated: state.last_sync,
            cache_hit: false,
        })
    }

    async fn acquire_sync_lock(&self, holder: &str) -> Result<bool, IndexError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if let Some((_, acquired_at)) = &state.lock {
            if now.duration_since(*acquired_at) < SYNC_LOCK_TIMEOUT {
                return Ok(false);
            }
        }
        state.lock = Some((holder.to_string(), now));
        Ok(true)
    }

    async fn release_sync_lock(&self, holder: &str) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        if state.lock.as_ref().is_some_and(|(h, _)| h == holder) {
            state.lock = None;
        }
        Ok(())
    }

    async fn publish_power_update(&self, event: &PowerUpdateEvent) -> Result<(), IndexError> {
        self.state.lock().unwrap().published.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ordering_with_tie_break() {
        let index = MemoryIndex::new();
        index.upsert(10, 100_000).await.unwrap();
        index.upsert(2, 100_000).await.unwrap();
        index.upsert(5, 200_000).await.unwrap();

        let top = index.top_n(10).await.unwrap();
        let ids: Vec<i64> = top.iter().map(|m| m.player_id).collect();
        assert_eq!(ids, vec![5, 2, 10]);

        assert_eq!(index.rank_of(5).await.unwrap(), Some(1));
        assert_eq!(index.rank_of(2).await.unwrap(), Some(2));
        assert_eq!(index.rank_of(10).await.unwrap(), Some(3));
        assert_eq!(index.rank_of(99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upsert_replaces_score() {
        let index = MemoryIndex::new();
        index.upsert(1, 100).await.unwrap();
        index.upsert(1, 300).await.unwrap();

        assert_eq!(index.size().await.unwrap(), 1);
        assert_eq!(index.score_of(1).await.unwrap(), 300);
        assert_eq!(index.score_of(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trim_keeps_top_k() {
        let index = MemoryIndex::new();
        for (id, score) in [(1, 500), (2, 400), (3, 300), (4, 100)] {
            index.upsert(id, score).await.unwrap();
        }
        index.trim(3).await.unwrap();

        assert_eq!(index.size().await.unwrap(), 3);
        assert_eq!(index.rank_of(4).await.unwrap(), None);
        assert_eq!(index.score_at_rank(3).await.unwrap(), Some(300));
        assert_eq!(index.score_at_rank(4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_window_clamps_to_bounds() {
        let index = MemoryIndex::new();
        for id in 1..=10 {
            index.upsert(id, 1000 - id).await.unwrap();
        }

        // Window around rank 1 clamps its low edge.
        let window = index.window_around_rank(1, 3).await.unwrap();
        let ids: Vec<i64> = window.iter().map(|m| m.player_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        // Window around the last rank clamps its high edge.
        let window = index.window_around_rank(10, 3).await.unwrap();
        let ids: Vec<i64> = window.iter().map(|m| m.player_id).collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_sync_lock_exclusion_and_matching_release() {
        let index = MemoryIndex::new();
        assert!(index.acquire_sync_lock("a").await.unwrap());
        assert!(!index.acquire_sync_lock("b").await.unwrap());

        // A non-holder release is a no-op.
        index.release_sync_lock("b").await.unwrap();
        assert!(!index.acquire_sync_lock("b").await.unwrap());

        index.release_sync_lock("a").await.unwrap();
        assert!(index.acquire_sync_lock("b").await.unwrap());
    }
}
