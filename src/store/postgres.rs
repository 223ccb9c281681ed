//! Postgres row store.
//!
//! Queries are runtime-bound so the crate builds without a live database.
//! The schema is created idempotently at startup; the `top_k_players`
//! materialized view carries a dense rank and a unique index so it can be
//! refreshed concurrently.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use super::{RankingStore, StoreError};
use crate::models::{LeaderboardEntry, PlayerRanking};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS player_rankings (
        player_id      BIGINT PRIMARY KEY,
        username       TEXT NOT NULL DEFAULT '',
        combat_power   BIGINT NOT NULL DEFAULT 0,
        total_points   INTEGER NOT NULL DEFAULT 0,
        total_battles  INTEGER NOT NULL DEFAULT 0,
        wins           INTEGER NOT NULL DEFAULT 0,
        losses         INTEGER NOT NULL DEFAULT 0,
        win_rate       DOUBLE PRECISION NOT NULL DEFAULT 0,
        last_battle_at TIMESTAMPTZ,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at     TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_player_rankings_combat_power
        ON player_rankings (combat_power DESC, player_id ASC)
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS top_k_players AS
        SELECT player_id,
               username,
               combat_power,
               total_points,
               wins,
               losses,
               win_rate,
               ROW_NUMBER() OVER (ORDER BY combat_power DESC, player_id ASC) AS rank,
               updated_at
        FROM player_rankings
        WHERE total_points > 0
        ORDER BY combat_power DESC, player_id ASC
        LIMIT 10000
    "#,
    // Concurrent refresh requires a unique index on the view.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_top_k_players_player_id
        ON top_k_players (player_id)
    "#,
];

const RANKING_COLUMNS: &str = "player_id, username, combat_power, total_points, total_battles, \
     wins, losses, win_rate, last_battle_at, created_at, updated_at";

/// Postgres-backed [`RankingStore`].
pub struct PgRankingStore {
    pool: PgPool,
}

impl PgRankingStore {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table, indices, and materialized projection if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }
}

#[async_trait]
impl RankingStore for PgRankingStore {
    async fn create(&self, ranking: &PlayerRanking) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO player_rankings (
                player_id, username, combat_power, total_points, total_battles,
                wins, losses, win_rate, last_battle_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(ranking.player_id)
        .bind(&ranking.username)
        .bind(ranking.combat_power)
        .bind(ranking.total_points)
        .bind(ranking.total_battles)
        .bind(ranking.wins)
        .bind(ranking.losses)
        .bind(ranking.win_rate)
        .bind(ranking.last_battle_at)
        .bind(ranking.created_at)
        .bind(ranking.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                Err(StoreError::Conflict(ranking.player_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, ranking: &PlayerRanking) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO player_rankings (
                player_id, username, combat_power, total_points, total_battles,
                wins, losses, win_rate, last_battle_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (player_id) DO UPDATE SET
                username       = excluded.username,
                combat_power   = excluded.combat_power,
                total_points   = excluded.total_points,
                total_battles  = excluded.total_battles,
                wins           = excluded.wins,
                losses         = excluded.losses,
                win_rate       = excluded.win_rate,
                last_battle_at = excluded.last_battle_at,
                updated_at     = excluded.updated_at
            "#,
        )
        .bind(ranking.player_id)
        .bind(&ranking.username)
        .bind(ranking.combat_power)
        .bind(ranking.total_points)
        .bind(ranking.total_battles)
        .bind(ranking.wins)
        .bind(ranking.losses)
        .bind(ranking.win_rate)
        .bind(ranking.last_battle_at)
        .bind(ranking.created_at)
        .bind(ranking.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_combat_power(
        &self,
        player_id: i64,
        combat_power: i64,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE player_rankings
            SET combat_power = $2, last_battle_at = $3, updated_at = $3
            WHERE player_id = $1
            "#,
        )
        .bind(player_id)
        .bind(combat_power)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn find_by_player_id(&self, player_id: i64) -> Result<PlayerRanking, StoreError> {
        let query = format!(
            "SELECT {RANKING_COLUMNS} FROM player_rankings WHERE player_id = $1"
        );
        sqlx::query_as::<_, PlayerRanking>(&query)
            .bind(player_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn find_by_player_ids(
        &self,
        player_ids: &[i64],
    ) -> Result<Vec<PlayerRanking>, StoreError> {
        if player_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {RANKING_COLUMNS} FROM player_rankings WHERE player_id = ANY($1)"
        );
        Ok(sqlx::query_as::<_, PlayerRanking>(&query)
            .bind(player_ids)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn find_top_n_by_combat_power(
        &self,
        limit: usize,
    ) -> Result<Vec<PlayerRanking>, StoreError> {
        let query = format!(
            "SELECT {RANKING_COLUMNS} FROM player_rankings \
             WHERE total_points > 0 \
             ORDER BY combat_power DESC, player_id ASC \
             LIMIT $1"
        );
        Ok(sqlx::query_as::<_, PlayerRanking>(&query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn kth_score(&self, k: usize) -> Result<i64, StoreError> {
        if k == 0 {
            return Ok(0);
        }
        let score: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT combat_power FROM player_rankings
            ORDER BY combat_power DESC, player_id ASC
            OFFSET $1 LIMIT 1
            "#,
        )
        .bind((k - 1) as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(score.unwrap_or(0))
    }

    async fn total_player_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM player_rankings")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn count_with_higher_power(&self, combat_power: i64) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM player_rankings WHERE combat_power > $1")
                .bind(combat_power)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn delete(&self, player_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM player_rankings WHERE player_id = $1")
            .bind(player_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn refresh_top_k_view(&self) -> Result<(), StoreError> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY top_k_players")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_top_n_from_view(
        &self,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        Ok(sqlx::query_as::<_, LeaderboardEntry>(
            r#"
            SELECT player_id, username, combat_power, total_points,
                   wins, losses, win_rate, rank, updated_at
            FROM top_k_players
            ORDER BY rank ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn player_rank_from_view(&self, player_id: i64) -> Result<Option<i64>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT rank FROM top_k_players WHERE player_id = $1")
                .bind(player_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}
