use crate::error::Result;
use sqlx::PgPool;
use tracing::info;

/// Run all database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, sql) in get_migrations() {
        if !is_migration_applied(pool, version).await? {
            info!(version, name, "applying migration");

            sqlx::query(sql).execute(pool).await?;
            record_migration(pool, version, name).await?;

            info!(version, name, "migration applied");
        }
    }

    Ok(())
}

async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let result =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM schema_migrations WHERE version = $1")
            .bind(version)
            .fetch_one(pool)
            .await?;

    Ok(result > 0)
}

async fn record_migration(pool: &PgPool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![(1, "proxies_table", MIGRATION_001_PROXIES_TABLE)]
}

// Migration 1: the authoritative `proxies` schema.
const MIGRATION_001_PROXIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS proxies (
    id SERIAL PRIMARY KEY,
    address VARCHAR(255) NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    type VARCHAR(20) NOT NULL DEFAULT 'http'
        CHECK (type IN ('http', 'https', 'socks4', 'socks5')),
    username VARCHAR(255),
    password VARCHAR(255),
    status VARCHAR(20) NOT NULL DEFAULT 'active'
        CHECK (status IN ('active', 'inactive', 'testing', 'failed')),
    error_count INTEGER NOT NULL DEFAULT 0 CHECK (error_count >= 0),
    success_count INTEGER NOT NULL DEFAULT 0 CHECK (success_count >= 0),
    last_used TIMESTAMPTZ,
    last_tested TIMESTAMPTZ,
    response_time_ms INTEGER,
    country CHAR(2),
    region VARCHAR(100),
    provider VARCHAR(100),
    notes TEXT,
    tags VARCHAR(255),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT unique_proxy_identity UNIQUE (address, port, username)
);

CREATE INDEX IF NOT EXISTS idx_proxies_status_error_count ON proxies (status, error_count);
CREATE INDEX IF NOT EXISTS idx_proxies_last_used ON proxies (last_used);
CREATE INDEX IF NOT EXISTS idx_proxies_last_tested ON proxies (last_tested);
CREATE INDEX IF NOT EXISTS idx_proxies_type ON proxies (type);
CREATE INDEX IF NOT EXISTS idx_proxies_country ON proxies (country);
CREATE INDEX IF NOT EXISTS idx_proxies_provider ON proxies (provider);
CREATE INDEX IF NOT EXISTS idx_proxies_response_time_ms ON proxies (response_time_ms);

CREATE OR REPLACE FUNCTION update_updated_at_column()
RETURNS TRIGGER AS $$
BEGIN
    NEW.updated_at = NOW();
    RETURN NEW;
END;
$$ language 'plpgsql';

DROP TRIGGER IF EXISTS update_proxies_updated_at ON proxies;
CREATE TRIGGER update_proxies_updated_at
    BEFORE UPDATE ON proxies
    FOR EACH ROW
    EXECUTE FUNCTION update_updated_at_column();
"#;
