use chrono::{Duration as ChronoDuration, Local, NaiveDate, Timelike};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::error::Result;
use crate::models::{DailyAggregate, RequestMetric};

/// Durable half of the Metrics Recorder: a dedicated SQLite database, wholly
/// separate from the Postgres-backed proxy catalog.
pub struct EmbeddedStore {
    pool: SqlitePool,
}

impl EmbeddedStore {
    pub async fn connect(db_path: &str) -> Result<Self> {
        if db_path != ":memory:" {
            if let Some(dir) = std::path::Path::new(db_path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = EmbeddedStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                url TEXT NOT NULL,
                method TEXT NOT NULL,
                success INTEGER NOT NULL,
                duration_ms REAL NOT NULL,
                proxy_id INTEGER,
                error_kind TEXT,
                content_length INTEGER,
                attempt_count INTEGER NOT NULL,
                request_id TEXT NOT NULL,
                created_date TEXT NOT NULL,
                local_hour INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_metrics_timestamp ON request_metrics(timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_metrics_created_date ON request_metrics(created_date)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                total_requests INTEGER NOT NULL,
                successful_requests INTEGER NOT NULL,
                failed_requests INTEGER NOT NULL,
                avg_duration_ms REAL NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_raw(&self, metric: &RequestMetric) -> Result<()> {
        let local = metric.timestamp.with_timezone(&Local);

        sqlx::query(
            r#"
            INSERT INTO request_metrics
                (timestamp, url, method, success, duration_ms, proxy_id, error_kind,
                 content_length, attempt_count, request_id, created_date, local_hour)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(metric.timestamp.to_rfc3339())
        .bind(&metric.url)
        .bind(&metric.method)
        .bind(metric.success)
        .bind(metric.duration_ms)
        .bind(metric.proxy_id)
        .bind(&metric.error_kind)
        .bind(metric.content_length.map(|n| n as i64))
        .bind(metric.attempt_count)
        .bind(&metric.request_id)
        .bind(local.date_naive().to_string())
        .bind(local.hour() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_daily(&self, agg: &DailyAggregate) -> Result<()> {
        let data = serde_json::json!({
            "error_kinds": agg.error_kinds,
            "proxy_usage": agg.proxy_usage,
            "methods_used": agg.methods_used,
        });

        sqlx::query(
            r#"
            INSERT INTO daily_stats
                (date, total_requests, successful_requests, failed_requests, avg_duration_ms, data)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                total_requests = excluded.total_requests,
                successful_requests = excluded.successful_requests,
                failed_requests = excluded.failed_requests,
                avg_duration_ms = excluded.avg_duration_ms,
                data = excluded.data
            "#,
        )
        .bind(agg.date.to_string())
        .bind(agg.total_requests as i64)
        .bind(agg.successful_requests as i64)
        .bind(agg.failed_requests as i64)
        .bind(agg.avg_duration_ms)
        .bind(data.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn daily_stats_since(&self, days: i64) -> Result<Vec<DailyAggregate>> {
        let cutoff = Local::now().date_naive() - ChronoDuration::days(days);

        let rows = sqlx::query(
            "SELECT date, total_requests, successful_requests, failed_requests, avg_duration_ms, data \
             FROM daily_stats WHERE date >= ? ORDER BY date DESC",
        )
        .bind(cutoff.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let date_str: String = row.try_get("date")?;
            let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
                .unwrap_or_else(|_| Local::now().date_naive());
            let data_str: String = row.try_get("data")?;
            let data: serde_json::Value =
                serde_json::from_str(&data_str).unwrap_or(serde_json::json!({}));

            out.push(DailyAggregate {
                date,
                total_requests: row.try_get::<i64, _>("total_requests")? as u64,
                successful_requests: row.try_get::<i64, _>("successful_requests")? as u64,
                failed_requests: row.try_get::<i64, _>("failed_requests")? as u64,
                avg_duration_ms: row.try_get("avg_duration_ms")?,
                error_kinds: serde_json::from_value(
                    data.get("error_kinds").cloned().unwrap_or(serde_json::json!({})),
                )
                .unwrap_or_default(),
                proxy_usage: serde_json::from_value(
                    data.get("proxy_usage").cloned().unwrap_or(serde_json::json!({})),
                )
                .unwrap_or_default(),
                methods_used: serde_json::from_value(
                    data.get("methods_used").cloned().unwrap_or(serde_json::json!({})),
                )
                .unwrap_or_default(),
            });
        }

        Ok(out)
    }

    /// Hourly breakdown of today's raw rows: (hour, requests, successful, avg_duration_ms).
    pub async fn hourly_breakdown_today(&self) -> Result<Vec<(u32, u64, u64, f64)>> {
        let today = Local::now().date_naive().to_string();

        let rows = sqlx::query(
            r#"
            SELECT local_hour AS hour,
                   COUNT(*) AS requests,
                   SUM(CASE WHEN success THEN 1 ELSE 0 END) AS successful,
                   AVG(duration_ms) AS avg_duration_ms
            FROM request_metrics
            WHERE created_date = ?
            GROUP BY local_hour
            ORDER BY local_hour
            "#,
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((
                row.try_get::<i64, _>("hour")? as u32,
                row.try_get::<i64, _>("requests")? as u64,
                row.try_get::<i64, _>("successful")? as u64,
                row.try_get::<f64, _>("avg_duration_ms")?,
            ));
        }

        Ok(out)
    }

    pub async fn evict_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = (Local::now().date_naive() - ChronoDuration::days(days)).to_string();

        let metrics_deleted = sqlx::query("DELETE FROM request_metrics WHERE created_date < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let daily_deleted = sqlx::query("DELETE FROM daily_stats WHERE date < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(metrics_deleted + daily_deleted)
    }
}
