//! Environment-driven relay settings. Every value has a local-development default;
//! pool sizing is read separately by `db::pool`.
//!
//! | Variable | Default |
//! |---|---|
//! | `DRAFTSYNC_RELAY_HOST` / `DRAFTSYNC_RELAY_PORT` | `0.0.0.0` / `8080` |
//! | `DRAFTSYNC_RELAY_JWT_SECRET` | development placeholder |
//! | `DRAFTSYNC_RELAY_DATABASE_URL` | unset: in-memory store |
//! | `DRAFTSYNC_RELAY_CORS_ORIGINS` | unset: local dev servers |
//! | `DRAFTSYNC_RELAY_LOG_FILTER` / `DRAFTSYNC_RELAY_LOG_FORMAT` | `info` / `text` |
//! | `DRAFTSYNC_SNAPSHOT_UPDATE_THRESHOLD` | `50` |
//! | `DRAFTSYNC_SNAPSHOT_INTERVAL_SECS` | `10` |
//! | `DRAFTSYNC_SNAPSHOT_CLOCK_TTL_SECS` | `3600` |
//! | `DRAFTSYNC_VERSIONS_PER_PAGE` | `10` |

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

const DEV_JWT_SECRET: &str = "draftsync_local_development_jwt_secret_must_be_32_chars";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_VERSIONS_PER_PAGE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Inputs to the snapshot policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSettings {
    /// Reported client updates that force a snapshot on their own.
    pub update_threshold: u32,
    /// Minimum age of the previous snapshot before a save cuts a new one.
    pub interval: Duration,
    /// Retention of each document's last-snapshot timestamp.
    pub clock_ttl: Duration,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            update_threshold: 50,
            interval: Duration::from_secs(10),
            clock_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub jwt_secret: String,
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Raw allow list handed to `cors::cors_layer`.
    pub cors_origins: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub snapshot: SnapshotSettings,
    pub versions_per_page: u32,
}

/// Reads one variable, treating blank values as unset.
struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn text(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.text(key).and_then(|value| value.trim().parse().ok())
    }

    /// Zero is never a meaningful threshold, page size or interval.
    fn positive<T: FromStr + PartialOrd + Default>(&self, key: &str, default: T) -> T {
        self.parsed(key).filter(|value| *value > T::default()).unwrap_or(default)
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(lookup);

        let host = vars.parsed("DRAFTSYNC_RELAY_HOST").unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = vars.parsed("DRAFTSYNC_RELAY_PORT").unwrap_or(DEFAULT_PORT);

        let log_format = match vars.text("DRAFTSYNC_RELAY_LOG_FORMAT") {
            Some(format) if format.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let defaults = SnapshotSettings::default();
        let seconds = |key: &str, fallback: Duration| {
            Duration::from_secs(vars.positive(key, fallback.as_secs()))
        };
        let snapshot = SnapshotSettings {
            update_threshold: vars
                .positive("DRAFTSYNC_SNAPSHOT_UPDATE_THRESHOLD", defaults.update_threshold),
            interval: seconds("DRAFTSYNC_SNAPSHOT_INTERVAL_SECS", defaults.interval),
            clock_ttl: seconds("DRAFTSYNC_SNAPSHOT_CLOCK_TTL_SECS", defaults.clock_ttl),
        };

        Self {
            listen_addr: SocketAddr::new(host, port),
            jwt_secret: vars
                .text("DRAFTSYNC_RELAY_JWT_SECRET")
                .unwrap_or_else(|| DEV_JWT_SECRET.to_owned()),
            database_url: vars.text("DRAFTSYNC_RELAY_DATABASE_URL"),
            cors_origins: vars.text("DRAFTSYNC_RELAY_CORS_ORIGINS"),
            log_filter: vars.text("DRAFTSYNC_RELAY_LOG_FILTER").unwrap_or_else(|| "info".to_owned()),
            log_format,
            snapshot,
            versions_per_page: vars
                .positive("DRAFTSYNC_VERSIONS_PER_PAGE", DEFAULT_VERSIONS_PER_PAGE),
        }
    }

    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
