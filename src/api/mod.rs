//! REST API endpoints.
//!
//! Axum-based read surface plus the internal admin operations. No
//! business logic lives here: handlers validate and parse, delegate to
//! the engine, and map error kinds to status codes.

pub mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::state::AppState;
use crate::engine::EngineError;

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/rankings", get(routes::rankings::get_leaderboard))
        .route(
            "/rankings/player/:player_id",
            get(routes::rankings::get_player_ranking),
        )
        .route(
            "/rankings/player/:player_id/context",
            get(routes::rankings::get_player_rank_with_context),
        )
        .route(
            "/rankings/combat-power",
            post(routes::rankings::update_combat_power),
        )
        .route("/rankings/sync", post(routes::rankings::sync_rankings))
        .route("/rankings/refresh-view", post(routes::rankings::refresh_view))
        .route("/health", get(routes::health::health_check))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API error types.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound => ApiError::NotFound("Player ranking not found".to_string()),
            EngineError::Validation(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        assert!(matches!(
            ApiError::from(EngineError::NotFound),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(EngineError::Validation("bad id".into())),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(EngineError::LockBusy),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_status_codes() {
        let resp = ApiError::NotFound("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError::BadRequest("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ApiError::Internal("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
