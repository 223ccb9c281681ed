//! Leaderboard and ranking endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::api::state::AppState;
use crate::api::ApiError;
use crate::engine::EngineError;
use crate::models::{Leaderboard, PlayerRankContext, RankedPlayer};

#[derive(Debug, Deserialize)]
pub struct LeaderboardParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ContextParams {
    pub context: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCombatPowerRequest {
    pub player_id: i64,
    pub combat_power: i64,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn get_leaderboard(
    State(state): State<AppState>,
    Query(params): Query<LeaderboardParams>,
) -> Result<Json<Leaderboard>, ApiError> {
    let board = state.engine.get_leaderboard(params.limit).await?;
    Ok(Json(board))
}

pub async fn get_player_ranking(
    State(state): State<AppState>,
    Path(player_id): Path<i64>,
) -> Result<Json<RankedPlayer>, ApiError> {
    let ranked = state.engine.get_player_ranking(player_id).await?;
    Ok(Json(ranked))
}

pub async fn get_player_rank_with_context(
    State(state): State<AppState>,
    Path(player_id): Path<i64>,
    Query(params): Query<ContextParams>,
) -> Result<Json<PlayerRankContext>, ApiError> {
    let context = state
        .engine
        .get_player_rank_with_context(player_id, params.context)
        .await?;
    Ok(Json(context))
}

pub async fn update_combat_power(
    State(state): State<AppState>,
    Json(request): Json<UpdateCombatPowerRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .engine
        .update_combat_power(request.player_id, request.combat_power)
        .await?;
    Ok(Json(MessageResponse {
        message: "Combat power updated successfully".to_string(),
    }))
}

/// Kick off a full index rebuild in the background. Answers 202
/// immediately; a rebuild already running elsewhere is not an error.
pub async fn sync_rankings(
    State(state): State<AppState>,
) -> (StatusCode, Json<MessageResponse>) {
    let engine = state.engine.clone();
    tokio::spawn(async move {
        match engine.sync_rankings().await {
            Ok(()) => {}
            Err(EngineError::LockBusy) => {
                info!("Ranking sync already running; request ignored")
            }
            Err(err) => error!(error = %err, "Requested ranking sync failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "Sync started".to_string(),
        }),
    )
}

/// Kick off a materialized-view refresh in the background.
pub async fn refresh_view(State(state): State<AppState>) -> (StatusCode, Json<MessageResponse>) {
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(err) = engine.refresh_materialized_view().await {
            error!(error = %err, "Requested view refresh failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "Materialized view refresh started".to_string(),
        }),
    )
}
