//! fetchcore - Entry Point
//!
//! Wires the Proxy Store, Proxy Pool, Fetch Executor and Metrics Recorder,
//! and starts the API facade with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod database;
mod error;
mod fetch;
mod metrics;
mod models;
mod pool;
mod store;

use api::ApiServer;
use config::Config;
use database::Database;
use fetch::Executor;
use metrics::MetricsRecorder;
use pool::Pool;
use store::postgres::PgProxyStore;
use store::Store;

#[tokio::main]
async fn main() -> error::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fetchcore=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting fetchcore");

    let config = Config::from_env()?;
    info!("configuration loaded");

    let db = Database::new(&config).await?;
    db.run_migrations().await?;
    info!("proxy store database ready");

    let backend = Arc::new(PgProxyStore::new(db.pool().clone(), &config.store));
    let store = Arc::new(Store::new(backend, config.circuit_breaker.clone()));

    let pool = Arc::new(Pool::new(store.clone(), config.pool.clone()));
    if let Err(e) = pool.force_refresh().await {
        error!(error = %e, "initial pool refresh failed, starting with an empty pool");
    }

    let metrics = Arc::new(MetricsRecorder::new(config.metrics.clone()).await?);

    let executor = Arc::new(Executor::new(config.fetch.clone()));

    let (shutdown_tx, _) = watch::channel(false);

    let pool_task = {
        let pool = pool.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            pool.run(shutdown).await;
        })
    };

    let metrics_task = {
        let metrics = metrics.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            metrics.run(shutdown).await;
        })
    };

    let api_server = ApiServer::new(
        config.api.clone(),
        config.clone(),
        pool.clone(),
        store.clone(),
        metrics.clone(),
        executor.clone(),
    );

    let api_shutdown = shutdown_tx.subscribe();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!(addr = %config.api_addr(), "fetchcore ready");

    shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(pool_task, metrics_task, api_task);

    info!("fetchcore stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
