use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::Result;
use crate::metrics::{CurrentStats, HistoricalStats};

use super::super::server::AppState;

pub async fn current(State(state): State<AppState>) -> Json<CurrentStats> {
    Json(state.metrics.current_stats())
}

#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    7
}

pub async fn historical(
    State(state): State<AppState>,
    Query(query): Query<HistoricalQuery>,
) -> Result<Json<HistoricalStats>> {
    let stats = state.metrics.historical_stats(query.days).await?;
    Ok(Json(stats))
}
