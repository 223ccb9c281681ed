use std::sync::Arc;

use crate::engine::RankingEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RankingEngine>,
}
