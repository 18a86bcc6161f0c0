//! Thin Axum facade over the core's fetch/store/metrics surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::{ApiServerConfig, Config};
use crate::error::{Error, Result};
use crate::fetch::Executor;
use crate::metrics::MetricsRecorder;
use crate::pool::Pool;
use crate::store::Store;

use super::routes;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub store: Arc<Store>,
    pub metrics: Arc<MetricsRecorder>,
    pub executor: Arc<Executor>,
    pub config: Config,
    pub started_at: Instant,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(
        api_config: ApiServerConfig,
        full_config: Config,
        pool: Arc<Pool>,
        store: Arc<Store>,
        metrics: Arc<MetricsRecorder>,
        executor: Arc<Executor>,
    ) -> Self {
        let state = AppState {
            pool,
            store,
            metrics,
            executor,
            config: full_config,
            started_at: Instant::now(),
        };

        Self {
            config: api_config,
            state,
        }
    }

    fn build_router(&self) -> Router {
        let cors = build_cors(&self.config.cors_origins);

        routes::create_router(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| Error::InvalidConfig(e.to_string()))?;

        let router = self.build_router();

        info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}

fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any)
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .max_age(Duration::from_secs(3600))
    }
}
