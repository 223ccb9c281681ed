//! Reconciliation: the periodic full index rebuild, the materialized-view
//! refresh, and the one-shot bootstrap from the external services.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::{EngineError, RankingEngine};
use crate::config::{SYNC_INTERVAL, VIEW_REFRESH_INTERVAL};
use crate::index::ScoredMember;
use crate::models::PlayerRanking;
use crate::store::StoreError;

impl RankingEngine {
    /// Rebuild the score index from the row store under the distributed
    /// sync lock. Returns [`EngineError::LockBusy`] when another instance
    /// holds the lock.
    pub async fn sync_rankings(&self) -> Result<(), EngineError> {
        if !self.index.acquire_sync_lock(&self.instance_id).await? {
            return Err(EngineError::LockBusy);
        }

        let result = self.rebuild_index().await;
        if let Err(err) = self.index.release_sync_lock(&self.instance_id).await {
            warn!(error = %err, "Failed to release sync lock; it will expire");
        }
        result
    }

    async fn rebuild_index(&self) -> Result<(), EngineError> {
        let rows = self.store.find_top_n_by_combat_power(self.top_k).await?;

        self.index.clear().await?;
        let members: Vec<ScoredMember> = rows
            .iter()
            .map(|row| ScoredMember {
                player_id: row.player_id,
                combat_power: row.combat_power,
            })
            .collect();
        self.index.batch_upsert(&members).await?;
        self.index.trim(self.top_k).await?;

        for row in &rows {
            self.index.cache_details(row).await?;
        }

        let threshold = if rows.len() >= self.top_k {
            self.store.kth_score(self.top_k).await?
        } else {
            0
        };
        self.index.set_threshold(threshold).await?;

        let total = self.store.total_player_count().await?;
        self.index.set_sync_metadata(total).await?;

        info!(players = rows.len(), "Ranking sync completed");
        Ok(())
    }

    /// Refresh the top-K materialized projection. Concurrent with readers;
    /// never touches the sync lock.
    pub async fn refresh_materialized_view(&self) -> Result<(), EngineError> {
        self.store.refresh_top_k_view().await?;
        info!("Materialized view refreshed");
        Ok(())
    }

    /// One-shot startup reconciliation: seed a row for every known player,
    /// then replay completed battles (stats only, zero point deltas). The
    /// replay runs only when the row store starts out empty, so re-running
    /// is a no-op; a missing upstream is tolerated and logged.
    pub async fn bootstrap_from_external_services(&self) -> Result<(), EngineError> {
        let fresh_store = self.store.total_player_count().await? == 0;

        let players = match self.players.fetch_all_players().await {
            Ok(players) => players,
            Err(err) => {
                warn!(error = %err, "Bootstrap skipped; player service unavailable");
                return Ok(());
            }
        };

        let now = Utc::now();
        let mut seeded = 0usize;
        for player in &players {
            let row = PlayerRanking::new(player.id, player.username.clone(), player.points, now);
            match self.store.create(&row).await {
                Ok(()) => seeded += 1,
                Err(StoreError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!(seeded, known = players.len(), "Seeded player rankings");

        if fresh_store {
            match self.battles.fetch_completed_battles().await {
                Ok(battles) => {
                    let mut replayed = 0usize;
                    for battle in battles {
                        let Some(loser_id) = battle.loser_id() else {
                            continue;
                        };
                        match self.apply_battle_outcome(battle.winner_id, loser_id, 0, 0).await {
                            Ok(()) => replayed += 1,
                            Err(err) => {
                                warn!(battle_id = battle.id, error = %err, "Battle replay failed")
                            }
                        }
                    }
                    info!(replayed, "Replayed battle history");
                }
                Err(err) => {
                    warn!(error = %err, "Bootstrap replay skipped; battle service unavailable")
                }
            }
        }

        if let Err(err) = self.sync_rankings().await {
            warn!(error = %err, "Post-bootstrap sync failed");
        }
        Ok(())
    }

    /// Background loop: rebuild the index every five minutes.
    pub async fn run_periodic_sync(self: Arc<Self>) {
        let mut ticker = interval(SYNC_INTERVAL);
        ticker.tick().await; // the first tick fires immediately

        info!("Starting periodic ranking sync every {:?}", SYNC_INTERVAL);
        loop {
            ticker.tick().await;
            match self.sync_rankings().await {
                Ok(()) => {}
                Err(EngineError::LockBusy) => {
                    info!("Ranking sync already running on another instance")
                }
                Err(err) => error!(error = %err, "Periodic ranking sync failed"),
            }
        }
    }

    /// Background loop: refresh the materialized projection every two
    /// minutes.
    pub async fn run_periodic_view_refresh(self: Arc<Self>) {
        let mut ticker = interval(VIEW_REFRESH_INTERVAL);
        ticker.tick().await;

        info!(
            "Starting periodic view refresh every {:?}",
            VIEW_REFRESH_INTERVAL
        );
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh_materialized_view().await {
                error!(error = %err, "Periodic view refresh failed");
            }
        }
    }
}
