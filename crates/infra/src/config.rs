//! Engine configuration.
//!
//! Loaded once at startup (usually via [`SyncConfig::from_env`]) and passed
//! explicitly to [`crate::engine::SyncEngine`]. Nothing here is global.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("{0} must be set for the postgres backend")]
    Missing(&'static str),
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Process-local stores (dev/tests).
    #[default]
    InMemory,
    Postgres,
}

/// Log output format for `shelf-observability`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Authoritative store + event store.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Read-model database; defaults to `database_url`.
    #[serde(default)]
    pub read_database_url: Option<String>,

    /// Upper bound for every store call made before a command commits.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Capacity of the projection hand-off queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Period of the projection worker's catch-up poll. 0 disables polling.
    #[serde(default = "default_catch_up_interval_ms")]
    pub catch_up_interval_ms: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_catch_up_interval_ms() -> u64 {
    30_000
}

fn default_max_connections() -> u32 {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            database_url: None,
            read_database_url: None,
            store_timeout_ms: default_store_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            catch_up_interval_ms: default_catch_up_interval_ms(),
            max_connections: default_max_connections(),
            log_format: LogFormat::default(),
        }
    }
}

impl SyncConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (unset keys fall back to defaults).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = SyncConfig::default();

        if let Some(raw) = lookup("SHELF_BACKEND") {
            cfg.backend = match raw.trim().to_ascii_lowercase().as_str() {
                "memory" | "in_memory" | "in-memory" => Backend::InMemory,
                "postgres" | "postgresql" => Backend::Postgres,
                other => {
                    return Err(ConfigError::Invalid {
                        key: "SHELF_BACKEND",
                        message: format!("unknown backend '{other}'"),
                    });
                }
            };
        }
        if let Some(raw) = lookup("SHELF_LOG_FORMAT") {
            cfg.log_format = match raw.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => {
                    return Err(ConfigError::Invalid {
                        key: "SHELF_LOG_FORMAT",
                        message: format!("unknown format '{other}'"),
                    });
                }
            };
        }

        cfg.database_url = lookup("DATABASE_URL").filter(|s| !s.trim().is_empty());
        cfg.read_database_url = lookup("READ_DATABASE_URL").filter(|s| !s.trim().is_empty());

        if let Some(v) = parse_number(&lookup, "SHELF_STORE_TIMEOUT_MS")? {
            cfg.store_timeout_ms = v;
        }
        if let Some(v) = parse_number(&lookup, "SHELF_QUEUE_CAPACITY")? {
            cfg.queue_capacity = v;
        }
        if let Some(v) = parse_number(&lookup, "SHELF_CATCH_UP_INTERVAL_MS")? {
            cfg.catch_up_interval_ms = v;
        }
        if let Some(v) = parse_number(&lookup, "SHELF_MAX_CONNECTIONS")? {
            cfg.max_connections = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == Backend::Postgres && self.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "SHELF_STORE_TIMEOUT_MS",
                message: "must be greater than 0".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "SHELF_QUEUE_CAPACITY",
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// `None` when periodic catch-up is disabled.
    pub fn catch_up_interval(&self) -> Option<Duration> {
        (self.catch_up_interval_ms > 0).then(|| Duration::from_millis(self.catch_up_interval_ms))
    }

    /// URL of the read-model database.
    pub fn read_url(&self) -> Option<&str> {
        self.read_database_url
            .as_deref()
            .or(self.database_url.as_deref())
    }
}

fn parse_number<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                message: e.to_string(),
            }),
    }
}
