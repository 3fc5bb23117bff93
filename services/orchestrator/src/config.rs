use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Runs migrations on startup.
    pub dev_mode: bool,
    /// `None` selects the in-memory store and directory.
    pub database: Option<DbConfig>,
    /// `None` selects the in-process usage cache.
    pub redis_url: Option<String>,
    pub usage_ttl: Duration,
    pub dispatch: DispatchConfig,
    /// Demo course seeded into the in-memory directory.
    pub demo_roster: DemoRoster,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DemoRoster {
    pub groups: usize,
    pub members: usize,
}

impl DemoRoster {
    pub fn is_empty(&self) -> bool {
        self.groups == 0 && self.members == 0
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub queue_capacity: usize,
    pub worker_concurrency: usize,
    pub redispatch_interval: Duration,
    pub delivery_lease: Duration,
    pub max_redeliveries: u32,
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

/// `None` when `DATABASE_URL` is unset or empty.
fn db_config() -> Result<Option<DbConfig>> {
    let Some(database_url) = std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    let defaults = DbConfig::default();
    Ok(Some(DbConfig {
        database_url,
        max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections)?.max(1),
        min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections)?,
        ..defaults
    }))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("LABFLEET_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid LABFLEET_LISTEN_ADDR")?;

        let log_level = std::env::var("LABFLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("LABFLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let redis_url = std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty());

        let dispatch = DispatchConfig {
            max_attempts: env_or("LABFLEET_DISPATCH_MAX_ATTEMPTS", 3u32)?.max(1),
            backoff_base: Duration::from_millis(env_or("LABFLEET_DISPATCH_BACKOFF_MS", 200u64)?),
            queue_capacity: env_or("LABFLEET_QUEUE_CAPACITY", 256usize)?.max(1),
            worker_concurrency: env_or("LABFLEET_WORKER_CONCURRENCY", 8usize)?.max(1),
            redispatch_interval: Duration::from_secs(
                env_or("LABFLEET_REDISPATCH_INTERVAL_SECS", 30u64)?.max(1),
            ),
            delivery_lease: Duration::from_secs(
                env_or("LABFLEET_DELIVERY_LEASE_SECS", 600u64)?.max(1),
            ),
            max_redeliveries: env_or("LABFLEET_MAX_REDELIVERIES", 3u32)?,
        };

        let demo_roster = DemoRoster {
            groups: env_or("LABFLEET_DEMO_GROUPS", 0usize)?,
            members: env_or("LABFLEET_DEMO_MEMBERS", 0usize)?,
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database: db_config()?,
            redis_url,
            usage_ttl: Duration::from_secs(env_or("LABFLEET_USAGE_TTL_SECS", 300u64)?),
            dispatch,
            demo_roster,
        })
    }
}
