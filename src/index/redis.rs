//! Redis-backed score index.
//!
//! Members are stored zero-padded to 20 digits so that score-tied groups
//! sort by player id lexicographically; [`rank_of`](ScoreIndex::rank_of)
//! resolves a member's exact position inside its tie group with
//! `ZCOUNT` + `ZRANGEBYSCORE`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Connection, Pool, Runtime};

use super::{
    player_details_key, IndexError, ScoreIndex, ScoredMember, LAST_SYNC_KEY, LEADERBOARD_KEY,
    POWER_UPDATES_CHANNEL, SYNC_LOCK_KEY, THRESHOLD_KEY, TOTAL_PLAYERS_KEY,
};
use crate::config::{PLAYER_CACHE_TTL, SYNC_LOCK_TIMEOUT};
use crate::models::{LeaderboardMetadata, PlayerRanking, PowerUpdateEvent};

/// Zero-padded member encoding; makes lexicographic order match numeric
/// order inside score-tied groups.
fn member(player_id: i64) -> String {
    format!("{player_id:020}")
}

fn parse_member(raw: &str) -> Option<i64> {
    raw.parse().ok()
}

fn parse_members(raw: Vec<(String, i64)>) -> Vec<ScoredMember> {
    raw.into_iter()
        .filter_map(|(m, score)| {
            parse_member(&m).map(|player_id| ScoredMember {
                player_id,
                combat_power: score,
            })
        })
        .collect()
}

/// Redis-backed [`ScoreIndex`].
pub struct RedisIndex {
    pool: Pool,
}

impl RedisIndex {
    /// Build a connection pool for the given Redis URL.
    pub fn connect(redis_url: &str) -> Result<Self, IndexError> {
        let pool = deadpool_redis::Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection, IndexError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl ScoreIndex for RedisIndex {
    async fn upsert(&self, player_id: i64, combat_power: i64) -> Result<(), IndexError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .zadd(LEADERBOARD_KEY, member(player_id), combat_power)
            .await?;
        Ok(())
    }

    async fn remove(&self, player_id: i64) -> Result<(), IndexError> {
        let mut conn = self.conn().await?;
        let _: () = conn.zrem(LEADERBOARD_KEY, member(player_id)).await?;
        Ok(())
    }

    async fn trim(&self, k: usize) -> Result<(), IndexError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .zremrangebyrank(LEADERBOARD_KEY, 0, -(k as isize) - 1)
            .await?;
        Ok(())
    }

    async fn top_n(&self, n: usize) -> Result<Vec<ScoredMember>, IndexError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let raw: Vec<(String, i64)> = conn
            .zrevrange_withscores(LEADERBOARD_KEY, 0, n as isize - 1)
            .await?;
        Ok(parse_members(raw))
    }

    async fn rank_of(&self, player_id: i64) -> Result<Option<i64>, IndexError> {
        let mut conn = self.conn().await?;
        let score: Option<i64> = conn.zscore(LEADERBOARD_KEY, member(player_id)).await?;
        let Some(score) = score else {
            return Ok(None);
        };

        // Members strictly above this score, then the position inside the
        // score-tied group (ascending id thanks to the padded encoding).
        let higher: i64 = conn
            .zcount(LEADERBOARD_KEY, format!("({score}"), "+inf")
            .await?;
        let group: Vec<String> = conn.zrangebyscore(LEADERBOARD_KEY, score, score).await?;
        let target = member(player_id);
        let position = group.iter().position(|m| *m == target).unwrap_or(0) as i64;

        Ok(Some(higher + position + 1))
    }

    async fn score_of(&self, player_id: i64) -> Result<i64, IndexError> {
        let mut conn = self.conn().await?;
        let score: Option<i64> = conn.zscore(LEADERBOARD_KEY, member(player_id)).await?;
        Ok(score.unwrap_or(0))
    }

    async fn score_at_rank(&self, rank: usize) -> Result<Option<i64>, IndexError> {
        if rank == 0 {
            return Ok(None);
        }
        let mut conn = self.conn().await?;
        let raw: Vec<(String, i64)> = conn
            .zrevrange_withscores(LEADERBOARD_KEY, rank as isize - 1, rank as isize - 1)
            .await?;
        Ok(raw.first().map(|(_, score)| *score))
    }

    async fn window_around_rank(
        &self,
        rank: i64,
        ctx: i64,
    ) -> Result<Vec<ScoredMember>, IndexError> {
        let mut conn = self.conn().await?;
        let size: i64 = conn.zcard(LEADERBOARD_KEY).await?;
        if size == 0 {
            return Ok(Vec::new());
        }

        let start = (rank - ctx).max(1);
        let end = (rank + ctx).min(size);
        let raw: Vec<(String, i64)> = conn
            .zrevrange_withscores(LEADERBOARD_KEY, start as isize - 1, end as isize - 1)
            .await?;
        Ok(parse_members(raw))
    }

    async fn size(&self) -> Result<i64, IndexError> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(LEADERBOARD_KEY).await?)
    }

    async fn clear(&self) -> Result<(), IndexError> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(LEADERBOARD_KEY).await?;
        Ok(())
    }

    async fn batch_upsert(&self, members: &[ScoredMember]) -> Result<(), IndexError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for m in members {
            pipe.zadd(LEADERBOARD_KEY, member(m.player_id), m.combat_power)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn cache_details(&self, ranking: &PlayerRanking) -> Result<(), IndexError> {
        let key = player_details_key(ranking.player_id);
        let fields: Vec<(&str, String)> = vec![
            ("username", ranking.username.clone()),
            ("combat_power", ranking.combat_power.to_string()),
            ("total_points", ranking.total_points.to_string()),
            ("total_battles", ranking.total_battles.to_string()),
            ("wins", ranking.wins.to_string()),
            ("losses", ranking.losses.to_string()),
            ("win_rate", ranking.win_rate.to_string()),
            ("updated_at", ranking.updated_at.to_rfc3339()),
        ];

        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.hset_multiple(&key, &fields).ignore();
        pipe.expire(&key, PLAYER_CACHE_TTL.as_secs() as i64).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_details(&self, player_id: i64) -> Result<Option<PlayerRanking>, IndexError> {
        let mut conn = self.conn().await?;
        let data: HashMap<String, String> = conn.hgetall(player_details_key(player_id)).await?;
        Ok(details_from_hash(player_id, data))
    }

    async fn batch_get_details(
        &self,
        player_ids: &[i64],
    ) -> Result<HashMap<i64, PlayerRanking>, IndexError> {
        if player_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for id in player_ids {
            pipe.hgetall(player_details_key(*id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut result = HashMap::new();
        for (id, data) in player_ids.iter().zip(hashes) {
            if let Some(ranking) = details_from_hash(*id, data) {
                result.insert(*id, ranking);
            }
        }
        Ok(result)
    }

    async fn threshold(&self) -> Result<i64, IndexError> {
        let mut conn = self.conn().await?;
        let value: Option<i64> = conn.get(THRESHOLD_KEY).await?;
        Ok(value.unwrap_or(0))
    }

    async fn set_threshold(&self, threshold: i64) -> Result<(), IndexError> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(THRESHOLD_KEY, threshold).await?;
        Ok(())
    }

    async fn set_sync_metadata(&self, total_players: i64) -> Result<(), IndexError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.set(TOTAL_PLAYERS_KEY, total_players).ignore();
        pipe.set(LAST_SYNC_KEY, Utc::now().to_rfc3339()).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn metadata(&self) -> Result<LeaderboardMetadata, IndexError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.get(TOTAL_PLAYERS_KEY);
        pipe.get(THRESHOLD_KEY);
        pipe.get(LAST_SYNC_KEY);
        let (total_players, threshold, last_sync): (Option<i64>, Option<i64>, Option<String>) =
            pipe.query_async(&mut conn).await?;

        Ok(LeaderboardMetadata {
            total_players: total_players.unwrap_or(0),
            top_k_threshold: threshold.unwrap_or(0),
            last_updated: last_sync
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            cache_hit: false,
        })
    }

    async fn acquire_sync_lock(&self, holder: &str) -> Result<bool, IndexError> {
        let mut conn = self.conn().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(SYNC_LOCK_KEY)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(SYNC_LOCK_TIMEOUT.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_sync_lock(&self, holder: &str) -> Result<(), IndexError> {
        let mut conn = self.conn().await?;
        let current: Option<String> = conn.get(SYNC_LOCK_KEY).await?;
        if current.as_deref() == Some(holder) {
            let _: () = conn.del(SYNC_LOCK_KEY).await?;
        }
        Ok(())
    }

    async fn publish_power_update(&self, event: &PowerUpdateEvent) -> Result<(), IndexError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn().await?;
        let _: i64 = conn.publish(POWER_UPDATES_CHANNEL, payload).await?;
        Ok(())
    }
}

fn details_from_hash(player_id: i64, data: HashMap<String, String>) -> Option<PlayerRanking> {
    if data.is_empty() {
        return None;
    }

    let field_i64 = |name: &str| data.get(name).and_then(|v| v.parse::<i64>().ok());
    let field_i32 = |name: &str| data.get(name).and_then(|v| v.parse::<i32>().ok());

    let updated_at = data
        .get("updated_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(PlayerRanking {
        player_id,
        username: data.get("username").cloned().unwrap_or_default(),
        combat_power: field_i64("combat_power").unwrap_or(0),
        total_points: field_i32("total_points").unwrap_or(0),
        total_battles: field_i32("total_battles").unwrap_or(0),
        wins: field_i32("wins").unwrap_or(0),
        losses: field_i32("losses").unwrap_or(0),
        win_rate: data
            .get("win_rate")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0),
        last_battle_at: None,
        created_at: updated_at,
        updated_at,
    })
}
