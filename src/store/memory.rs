//! In-memory row store used by the engine tests.
//!
//! Mirrors the Postgres gateway's observable behavior, including the
//! materialized projection: the view only reflects rows from the last
//! `refresh_top_k_view` call, so fallback ordering can be exercised
//! without live infrastructure.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{RankingStore, StoreError};
use crate::models::{LeaderboardEntry, PlayerRanking};

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<i64, PlayerRanking>>,
    view: Mutex<Vec<LeaderboardEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows ordered by `(combat_power DESC, player_id ASC)`, positive
    /// points only.
    fn ordered_rows(&self) -> Vec<PlayerRanking> {
        let rows = self.rows.lock().unwrap();
        let mut ordered: Vec<PlayerRanking> = rows
            .values()
            .filter(|r| r.total_points > 0)
            .cloned()
            .collect();
        ordered.sort_by(|a, b| {
            b.combat_power
                .cmp(&a.combat_power)
                .then(a.player_id.cmp(&b.player_id))
        });
        ordered
    }
}

#[async_trait]
impl RankingStore for MemoryStore {
    async fn create(&self, ranking: &PlayerRanking) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&ranking.player_id) {
            return Err(StoreError::Conflict(ranking.player_id));
        }
        rows.insert(ranking.player_id, ranking.clone());
        Ok(())
    }

    async fn update(&self, ranking: &PlayerRanking) -> Result<(), StoreError> {
        self.rows
            .lock()
            .unwrap()
            .insert(ranking.player_id, ranking.clone());
        Ok(())
    }

    async fn update_combat_power(
        &self,
        player_id: i64,
        combat_power: i64,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&player_id).ok_or(StoreError::NotFound)?;
        let now = chrono::Utc::now();
        row.combat_power = combat_power;
        row.last_battle_at = Some(now);
        row.updated_at = now;
        Ok(())
    }

    async fn find_by_player_id(&self, player_id: i64) -> Result<PlayerRanking, StoreError> {
        self.rows
            .lock()
            .unwrap()
            .get(&player_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_by_player_ids(
        &self,
        player_ids: &[i64],
    ) -> Result<Vec<PlayerRanking>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(player_ids
            .iter()
            .filter_map(|id| rows.get(id).cloned())
            .collect())
    }

    async fn find_top_n_by_combat_power(
        &self,
        limit: usize,
    ) -> Result<Vec<PlayerRanking>, StoreError> {
        let mut ordered = self.ordered_rows();
        ordered.truncate(limit);
        Ok(ordered)
    }

    async fn kth_score(&self, k: usize) -> Result<i64, StoreError> {
        if k == 0 {
            return Ok(0);
        }
        let rows = self.rows.lock().unwrap();
        let mut scores: Vec<i64> = rows.values().map(|r| r.combat_power).collect();
        scores.sort_unstable_by(|a, b| b.cmp(a));
        Ok(scores.get(k - 1).copied().unwrap_or(0))
    }

    async fn total_player_count(&self) -> Result<i64, StoreError> {
        Ok(self.rows.lock().unwrap().len() as i64)
    }

    async fn count_with_higher_power(&self, combat_power: i64) -> Result<i64, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|r| r.combat_power > combat_power)
            .count() as i64)
    }

    async fn delete(&self, player_id: i64) -> Result<(), StoreError> {
        self.rows.lock().unwrap().remove(&player_id);
        Ok(())
    }

    async fn refresh_top_k_view(&self) -> Result<(), StoreError> {
        let snapshot: Vec<LeaderboardEntry> = self
            .ordered_rows()
            .iter()
            .enumerate()
            .map(|(i, row)| LeaderboardEntry::from_ranking(row, i as i64 + 1))
            .collect();
        *self.view.lock().unwrap() = snapshot;
        Ok(())
    }

    async fn find_top_n_from_view(
        &self,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let view = self.view.lock().unwrap();
        Ok(view.iter().take(limit).cloned().collect())
    }

    async fn player_rank_from_view(&self, player_id: i64) -> Result<Option<i64>, StoreError> {
        let view = self.view.lock().unwrap();
        Ok(view
            .iter()
            .find(|e| e.player_id == player_id)
            .map(|e| e.rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(player_id: i64, points: i32) -> PlayerRanking {
        PlayerRanking::new(player_id, format!("player-{player_id}"), points, Utc::now())
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = MemoryStore::new();
        store.create(&row(1, 1000)).await.unwrap();

        let err = store.create(&row(1, 500)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(1)));
    }

    #[tokio::test]
    async fn test_top_n_ordering_and_tie_break() {
        let store = MemoryStore::new();
        store.create(&row(9, 500)).await.unwrap();
        store.create(&row(3, 800)).await.unwrap();
        store.create(&row(7, 800)).await.unwrap();
        store.create(&row(5, -10)).await.unwrap();

        let top = store.find_top_n_by_combat_power(10).await.unwrap();
        let ids: Vec<i64> = top.iter().map(|r| r.player_id).collect();
        // Ties broken by ascending player id; non-positive points excluded.
        assert_eq!(ids, vec![3, 7, 9]);
    }

    #[tokio::test]
    async fn test_kth_score() {
        let store = MemoryStore::new();
        for (id, points) in [(1, 500), (2, 400), (3, 300)] {
            store.create(&row(id, points)).await.unwrap();
        }

        assert_eq!(store.kth_score(1).await.unwrap(), 50_000);
        assert_eq!(store.kth_score(3).await.unwrap(), 30_000);
        assert_eq!(store.kth_score(4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_view_is_a_snapshot() {
        let store = MemoryStore::new();
        store.create(&row(1, 500)).await.unwrap();
        assert!(store.find_top_n_from_view(10).await.unwrap().is_empty());

        store.refresh_top_k_view().await.unwrap();
        let entries = store.find_top_n_from_view(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rank, 1);

        // The snapshot does not move until the next refresh.
        store.create(&row(2, 900)).await.unwrap();
        assert_eq!(store.find_top_n_from_view(10).await.unwrap().len(), 1);
        assert_eq!(store.player_rank_from_view(1).await.unwrap(), Some(1));
        assert_eq!(store.player_rank_from_view(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.create(&row(1, 500)).await.unwrap();
        store.delete(1).await.unwrap();
        store.delete(1).await.unwrap();
        assert!(matches!(
            store.find_by_player_id(1).await,
            Err(StoreError::NotFound)
        ));
    }
}
