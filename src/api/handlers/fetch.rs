use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::super::server::AppState;

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_use_proxy")]
    pub use_proxy: bool,
}

fn default_use_proxy() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub body: String,
    pub proxy_id: Option<i64>,
    pub attempt_count: u32,
}

pub async fn fetch(
    State(state): State<AppState>,
    Json(req): Json<FetchRequest>,
) -> Result<Json<FetchResponse>> {
    let outcome = state
        .executor
        .fetch(&req.url, req.use_proxy, Some(&state.pool), &state.metrics)
        .await?;

    Ok(Json(FetchResponse {
        body: String::from_utf8_lossy(&outcome.body).into_owned(),
        proxy_id: outcome.proxy_id,
        attempt_count: outcome.attempt_count,
    }))
}
