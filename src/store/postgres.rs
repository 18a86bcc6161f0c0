use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::OnceLock;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::Proxy;

use super::{ConnectionCheck, ProxyStoreBackend, StoreStats, TableProbe};

const REQUIRED_COLUMNS: &[&str] = &[
    "id", "address", "port", "type", "username", "password", "status", "error_count",
];

/// Postgres-backed Proxy Store. Holds a one-shot cached probe of optional
/// schema features (`probe_schema_features`) so writes that target them
/// become no-ops once the column is known absent.
pub struct PgProxyStore {
    pool: PgPool,
    error_threshold: i32,
    has_last_used: OnceLock<bool>,
}

impl PgProxyStore {
    pub fn new(pool: PgPool, config: &StoreConfig) -> Self {
        PgProxyStore {
            pool,
            error_threshold: config.proxy_error_threshold,
            has_last_used: OnceLock::new(),
        }
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM information_schema.columns WHERE table_name = $1 AND column_name = $2",
        )
        .bind(table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}

#[async_trait]
impl ProxyStoreBackend for PgProxyStore {
    async fn test_connection(&self) -> Result<ConnectionCheck> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(ConnectionCheck {
                ok: true,
                message: "connection ok".to_string(),
            }),
            Err(sqlx::Error::Io(e)) => Ok(ConnectionCheck {
                ok: false,
                message: format!("host unreachable: {e}"),
            }),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("28P01") => {
                Ok(ConnectionCheck {
                    ok: false,
                    message: "authentication failed".to_string(),
                })
            }
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("3D000") => {
                Ok(ConnectionCheck {
                    ok: false,
                    message: "database does not exist".to_string(),
                })
            }
            Err(sqlx::Error::PoolTimedOut) => Ok(ConnectionCheck {
                ok: false,
                message: "connection attempt timed out".to_string(),
            }),
            Err(e) => Ok(ConnectionCheck {
                ok: false,
                message: e.to_string(),
            }),
        }
    }

    async fn probe_proxies_table(&self) -> Result<TableProbe> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'proxies')",
        )
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Ok(TableProbe {
                ok: false,
                message: "proxies table does not exist".to_string(),
                active_count: 0,
            });
        }

        for column in REQUIRED_COLUMNS {
            if !self.column_exists("proxies", column).await? {
                return Ok(TableProbe {
                    ok: false,
                    message: format!("proxies table missing required column: {column}"),
                    active_count: 0,
                });
            }
        }

        let active_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM proxies WHERE status = 'active' AND error_count < $1",
        )
        .bind(self.error_threshold)
        .fetch_one(&self.pool)
        .await?;

        Ok(TableProbe {
            ok: true,
            message: "proxies table ok".to_string(),
            active_count,
        })
    }

    async fn probe_schema_features(&self) -> Result<()> {
        if self.has_last_used.get().is_none() {
            let present = self.column_exists("proxies", "last_used").await?;
            let _ = self.has_last_used.set(present);
        }
        Ok(())
    }

    async fn fetch_active(&self, limit: i64) -> Result<Vec<Proxy>> {
        let overfetch = limit.saturating_mul(2).max(limit + 10);
        let rows = sqlx::query_as::<_, Proxy>(
            r#"
            SELECT id, address, port, type, username, password, status,
                   error_count, success_count, last_used, last_tested,
                   response_time_ms, country, created_at, updated_at
            FROM proxies
            WHERE status = 'active' AND error_count < $1
            ORDER BY error_count ASC, RANDOM()
            LIMIT $2
            "#,
        )
        .bind(self.error_threshold)
        .bind(overfetch)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().take(limit as usize).collect())
    }

    async fn increment_error(&self, id: i64) -> Result<(i32, String)> {
        let row = sqlx::query(
            r#"
            UPDATE proxies
            SET error_count = error_count + 1,
                status = CASE WHEN error_count + 1 >= $2 THEN 'inactive' ELSE status END
            WHERE id = $1
            RETURNING error_count, status
            "#,
        )
        .bind(id)
        .bind(self.error_threshold)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::ProxyNotFound { id })?;

        let error_count: i32 = row.try_get("error_count")?;
        let status: String = row.try_get("status")?;
        Ok((error_count, status))
    }

    async fn mark_last_used(&self, id: i64) -> Result<()> {
        self.probe_schema_features().await?;
        if self.has_last_used.get().copied() == Some(false) {
            return Ok(());
        }

        sqlx::query("UPDATE proxies SET last_used = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn reset_errors(&self, max_error_count: i32) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE proxies SET error_count = 0, status = 'active' \
             WHERE error_count <= $1 AND status = 'inactive'",
        )
        .bind(max_error_count)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'active' AND error_count < $1) AS usable,
                COUNT(*) FILTER (WHERE error_count >= $1) AS high_error,
                COALESCE(AVG(error_count), 0.0)::float8 AS avg_error_count
            FROM proxies
            "#,
        )
        .bind(self.error_threshold)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            total: row.try_get("total")?,
            active: row.try_get("active")?,
            usable: row.try_get("usable")?,
            high_error: row.try_get("high_error")?,
            avg_error_count: row.try_get::<f64, _>("avg_error_count")?,
        })
    }
}
