//! Thin Axum facade over the core: fetch/health/metrics routes only. No
//! authentication, templating, or websocket streaming.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::{AppState, ApiServer};
