use crate::error::{Error, Result};
use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub pool: PoolConfig,
    pub store: StoreConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub fetch: FetchConfig,
    pub metrics: MetricsConfig,
    pub api: ApiServerConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target FIFO size after a refresh.
    pub proxy_pool_size: usize,
    /// Below this, a refresh is triggered early.
    pub min_proxy_pool_size: usize,
    /// Periodic refresh cadence.
    pub refresh_interval: std::time::Duration,
    /// Writeback flush cadence.
    pub batch_update_interval: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// status -> inactive threshold.
    pub proxy_error_threshold: i32,
    pub db_pool_min: u32,
    pub db_pool_max: u32,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Retry attempts before the direct fallback (total attempts = this + 1).
    pub proxy_retry_count: u32,
    pub request_timeout: std::time::Duration,
    pub connect_timeout: std::time::Duration,
    pub backoff_base: std::time::Duration,
    pub max_content_length_bytes: u64,
    /// Concurrent outbound fetch permits.
    pub worker_pool_size: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub max_memory_entries: usize,
    pub memory_retention_hours: i64,
    pub db_retention_days: i64,
    pub db_path: String,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            pool: PoolConfig {
                proxy_pool_size: get_env_parsed("PROXY_POOL_SIZE", 50)?,
                min_proxy_pool_size: get_env_parsed("MIN_PROXY_POOL_SIZE", 10)?,
                refresh_interval: std::time::Duration::from_secs(get_env_parsed(
                    "PROXY_REFRESH_INTERVAL_S",
                    300,
                )?),
                batch_update_interval: std::time::Duration::from_secs(get_env_parsed(
                    "BATCH_UPDATE_INTERVAL_S",
                    60,
                )?),
            },
            store: StoreConfig {
                proxy_error_threshold: get_env_parsed("PROXY_ERROR_THRESHOLD", 3)?,
                db_pool_min: get_env_parsed("DB_POOL_MIN", 2)?,
                db_pool_max: get_env_parsed("DB_POOL_MAX", 10)?,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: get_env_parsed("CB_FAILURE_THRESHOLD", 5)?,
                recovery_timeout: std::time::Duration::from_secs(get_env_parsed(
                    "CB_RECOVERY_TIMEOUT_S",
                    60,
                )?),
            },
            fetch: FetchConfig {
                proxy_retry_count: get_env_parsed("PROXY_RETRY_COUNT", 3)?,
                request_timeout: std::time::Duration::from_secs(get_env_parsed(
                    "REQUEST_TIMEOUT_S",
                    15,
                )?),
                connect_timeout: std::time::Duration::from_secs(get_env_parsed(
                    "CONNECT_TIMEOUT_S",
                    5,
                )?),
                backoff_base: std::time::Duration::from_millis(get_env_parsed(
                    "BACKOFF_BASE_MS",
                    500,
                )?),
                max_content_length_bytes: get_env_parsed("MAX_CONTENT_LENGTH_BYTES", 10_485_760)?,
                worker_pool_size: get_env_parsed("WORKER_POOL_SIZE", 10)?,
                user_agent: get_env_or(
                    "FETCH_USER_AGENT",
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
                ),
            },
            metrics: MetricsConfig {
                max_memory_entries: get_env_parsed("MAX_MEMORY_ENTRIES", 10_000)?,
                memory_retention_hours: get_env_parsed("MEMORY_RETENTION_HOURS", 24)?,
                db_retention_days: get_env_parsed("DB_RETENTION_DAYS", 30)?,
                db_path: get_env_or("METRICS_DB_PATH", "data/metrics.db"),
            },
            api: ApiServerConfig {
                port: get_env_parsed("API_PORT", 8001)?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                cors_origins: get_env_or("CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            database: DatabaseConfig {
                host: get_env_or("DB_HOST", "localhost"),
                port: get_env_parsed("DB_PORT", 5432)?,
                user: get_env_or("DB_USER", "fetchcore"),
                password: get_env_or("DB_PASSWORD", "fetchcore"),
                name: get_env_or("DB_NAME", "fetchcore"),
                ssl_mode: get_env_or("DB_SSLMODE", "disable"),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// The Postgres connection URL for the proxy catalog.
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.database.user,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.name,
            self.database.ssl_mode
        )
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{key} must be a valid value"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::from_env().unwrap();

        assert_eq!(config.pool.proxy_pool_size, 50);
        assert_eq!(config.pool.min_proxy_pool_size, 10);
        assert_eq!(config.store.proxy_error_threshold, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.fetch.proxy_retry_count, 3);
        assert_eq!(config.metrics.max_memory_entries, 10_000);
        assert_eq!(config.api.port, 8001);
        assert_eq!(config.database.host, "localhost");
    }

    #[test]
    fn database_url_includes_sslmode() {
        let config = Config::from_env().unwrap();
        assert!(config.database_url().contains("sslmode=disable"));
    }
}
