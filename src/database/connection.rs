use crate::config::Config;
use crate::error::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Pooled connection to the Postgres-backed proxy catalog.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &Config) -> Result<Self> {
        let database_url = config.database_url();

        info!(
            host = %config.database.host,
            port = %config.database.port,
            database = %config.database.name,
            "connecting to proxy store database"
        );

        let pool = PgPoolOptions::new()
            .min_connections(config.store.db_pool_min)
            .max_connections(config.store.db_pool_max)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(30 * 60))
            .max_lifetime(Duration::from_secs(60 * 60))
            .connect(&database_url)
            .await
            .map_err(|e| Error::DatabaseConnection(e.to_string()))?;

        info!("proxy store connection pool established");

        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `test_connection()`: opens a connection, runs a trivial SELECT.
    pub async fn health_check(&self) -> Result<Duration> {
        let start = std::time::Instant::now();

        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(start.elapsed())
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
        }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("running proxy store migrations");
        super::migrations::run_migrations(&self.pool).await?;
        info!("proxy store migrations complete");
        Ok(())
    }

    pub async fn close(&self) {
        info!("closing proxy store connection pool");
        self.pool.close().await;
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
}

impl std::ops::Deref for Database {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}
