use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_CLEANUP_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Settings for the PostgreSQL driver.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub cleanup_queue_capacity: usize,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            cleanup_queue_capacity: DEFAULT_CLEANUP_QUEUE_CAPACITY,
        }
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn cleanup_queue_capacity(mut self, capacity: usize) -> Self {
        self.cleanup_queue_capacity = capacity;
        self
    }

    /// Reads `DATABASE_URL` and the optional `DB_*` / `CLEANUP_QUEUE_CAPACITY`
    /// overrides. Unset overrides keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let mut config = Self::new(database_url);

        if let Some(n) = parse_var::<u32>("DB_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(n) = parse_var::<u32>("DB_MIN_CONNECTIONS")? {
            config.min_connections = n;
        }
        if let Some(secs) = parse_var::<u64>("DB_ACQUIRE_TIMEOUT_SECS")? {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("DB_IDLE_TIMEOUT_SECS")? {
            // 0 disables the idle timeout
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(n) = parse_var::<usize>("CLEANUP_QUEUE_CAPACITY")? {
            config.cleanup_queue_capacity = n;
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(None),
    }
}
