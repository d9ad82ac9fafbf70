use std::{str::FromStr, time::Duration};

use anyhow::{ensure, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::{info_span, Instrument};

/// Sizing for the PostgreSQL pool behind the event log and version history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { min_connections: 2, max_connections: 20, acquire_timeout: Duration::from_secs(10) }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|raw| raw.trim().parse().ok())
        }

        let defaults = Self::default();
        let min_connections =
            parsed(&lookup, "DRAFTSYNC_RELAY_DB_MIN_CONNECTIONS").unwrap_or(defaults.min_connections);
        // A pool smaller than its floor would never satisfy `min_connections`.
        let max_connections = parsed(&lookup, "DRAFTSYNC_RELAY_DB_MAX_CONNECTIONS")
            .unwrap_or(defaults.max_connections)
            .max(min_connections)
            .max(1);
        let acquire_timeout = parsed(&lookup, "DRAFTSYNC_RELAY_DB_ACQUIRE_TIMEOUT_SECS")
            .map_or(defaults.acquire_timeout, Duration::from_secs);

        Self { min_connections, max_connections, acquire_timeout }
    }
}

/// Open the pool. The relay refuses plaintext connections to the database.
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let options: PgConnectOptions =
        database_url.parse().context("DATABASE_URL is not a valid PostgreSQL url")?;
    require_tls(&options)?;

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .instrument(info_span!("relay.db.connect", max = config.max_connections))
        .await
        .context("could not reach PostgreSQL")
}

fn require_tls(options: &PgConnectOptions) -> Result<()> {
    let mode = options.get_ssl_mode();
    ensure!(
        matches!(mode, PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull),
        "PostgreSQL connection must require TLS (sslmode={mode:?}); use sslmode=require or stricter"
    );
    Ok(())
}

pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .instrument(info_span!("relay.db.query", query = "ping"))
        .await
        .context("PostgreSQL did not answer the readiness ping")?;
    Ok(())
}
