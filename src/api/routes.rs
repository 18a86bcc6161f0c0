//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router: `/fetch`, `/health`, `/metrics/current`,
/// `/metrics/historical`. No authentication, as this facade is an optional
/// process-boundary convenience over the core, not a multi-tenant surface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/fetch", post(handlers::fetch::fetch))
        .route("/metrics/current", get(handlers::metrics::current))
        .route("/metrics/historical", get(handlers::metrics::historical))
        .with_state(state)
}
