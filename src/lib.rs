//! fetchcore - resilient outbound fetcher
//!
//! A fetch core that obtains HTML through a rotating, self-healing set of
//! upstream proxies: a bounded proxy pool backed by a circuit-breaker-guarded
//! SQL store, an exponential-backoff retry executor, and time-series
//! metrics. A thin Axum facade exposes it over HTTP.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod store;

pub use config::Config;
pub use database::Database;
pub use error::{Error, Result};
