use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::super::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub store_ok: bool,
    pub store_message: String,
    pub breaker_state: String,
    pub pool_size: usize,
    pub pool_fail_set_size: usize,
    pub uptime_s: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let check = match state.store.test_connection().await {
        Ok(check) => check,
        Err(e) => crate::store::ConnectionCheck {
            ok: false,
            message: e.to_string(),
        },
    };

    let snapshot = state.pool.snapshot();

    Json(HealthResponse {
        store_ok: check.ok,
        store_message: check.message,
        breaker_state: state.store.breaker_state().to_string(),
        pool_size: snapshot.size,
        pool_fail_set_size: snapshot.fail_set_size,
        uptime_s: state.started_at.elapsed().as_secs(),
    })
}
