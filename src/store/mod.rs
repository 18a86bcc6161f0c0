pub mod circuit_breaker;
pub mod postgres;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::CircuitBreakerConfig;
use crate::error::Result;
use crate::models::Proxy;

use circuit_breaker::CircuitBreaker;

/// Diagnostic result of opening a connection and running a trivial query.
#[derive(Debug, Clone)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub message: String,
}

/// Diagnostic result of probing the `proxies` relation.
#[derive(Debug, Clone)]
pub struct TableProbe {
    pub ok: bool,
    pub message: String,
    pub active_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total: i64,
    pub active: i64,
    pub usable: i64,
    pub high_error: i64,
    pub avg_error_count: f64,
}

/// Raw Proxy Store operations, one call = one (possibly failing) trip to the
/// database. The circuit breaker that wraps every call lives one layer up in
/// [`Store`], so implementations of this trait should propagate failures
/// rather than swallow them (test_connection/probe_proxies_table are the
/// exception: they are diagnostics, and report failure in their result
/// rather than as an `Err`).
#[async_trait]
pub trait ProxyStoreBackend: Send + Sync {
    async fn test_connection(&self) -> Result<ConnectionCheck>;
    async fn probe_proxies_table(&self) -> Result<TableProbe>;
    async fn probe_schema_features(&self) -> Result<()>;
    async fn fetch_active(&self, limit: i64) -> Result<Vec<Proxy>>;
    async fn increment_error(&self, id: i64) -> Result<(i32, String)>;
    async fn mark_last_used(&self, id: i64) -> Result<()>;
    async fn reset_errors(&self, max_error_count: i32) -> Result<u64>;
    async fn stats(&self) -> Result<StoreStats>;
}

/// The Proxy Store: a backend plus the circuit breaker that wraps every call.
pub struct Store {
    backend: Arc<dyn ProxyStoreBackend>,
    breaker: CircuitBreaker,
}

impl Store {
    pub fn new(backend: Arc<dyn ProxyStoreBackend>, breaker_config: CircuitBreakerConfig) -> Self {
        Store {
            backend,
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    pub async fn test_connection(&self) -> Result<ConnectionCheck> {
        self.breaker.call(|| self.backend.test_connection()).await
    }

    pub async fn probe_proxies_table(&self) -> Result<TableProbe> {
        self.breaker
            .call(|| self.backend.probe_proxies_table())
            .await
    }

    pub async fn probe_schema_features(&self) -> Result<()> {
        self.breaker
            .call(|| self.backend.probe_schema_features())
            .await
    }

    pub async fn fetch_active(&self, limit: i64) -> Result<Vec<Proxy>> {
        self.breaker.call(|| self.backend.fetch_active(limit)).await
    }

    pub async fn increment_error(&self, id: i64) -> Result<(i32, String)> {
        self.breaker.call(|| self.backend.increment_error(id)).await
    }

    pub async fn mark_last_used(&self, id: i64) -> Result<()> {
        self.breaker.call(|| self.backend.mark_last_used(id)).await
    }

    pub async fn reset_errors(&self, max_error_count: i32) -> Result<u64> {
        self.breaker
            .call(|| self.backend.reset_errors(max_error_count))
            .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.breaker.call(|| self.backend.stats()).await
    }

    /// Current circuit breaker state, for the `/health` facade route.
    pub fn breaker_state(&self) -> &'static str {
        self.breaker.state_label()
    }
}
