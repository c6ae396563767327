//! Configuration loading and representation.
//!
//! Everything has a default except the database URL, which is only needed by
//! the PostgreSQL backends. Values come from the process environment:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | none |
//! | `CHRONICLE_EVENTS_TABLE` | `chronicle_events` |
//! | `CHRONICLE_APPLIED_EVENTS_TABLE` | `chronicle_applied_events` |
//! | `CHRONICLE_RESERVATION_TIMEOUT_MS` | `2000` |
//! | `CHRONICLE_WORKER_POLL_INTERVAL_MS` | `100` |
//! | `CHRONICLE_WORKER_MAX_ATTEMPTS` | `5` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const EVENTS_TABLE: &str = "CHRONICLE_EVENTS_TABLE";
pub const APPLIED_EVENTS_TABLE: &str = "CHRONICLE_APPLIED_EVENTS_TABLE";
pub const RESERVATION_TIMEOUT_MS: &str = "CHRONICLE_RESERVATION_TIMEOUT_MS";
pub const WORKER_POLL_INTERVAL_MS: &str = "CHRONICLE_WORKER_POLL_INTERVAL_MS";
pub const WORKER_MAX_ATTEMPTS: &str = "CHRONICLE_WORKER_MAX_ATTEMPTS";

pub const DEFAULT_EVENTS_TABLE: &str = "chronicle_events";
pub const DEFAULT_APPLIED_EVENTS_TABLE: &str = "chronicle_applied_events";
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_WORKER_MAX_ATTEMPTS: u32 = 5;

/// PostgreSQL's identifier length limit.
const MAX_IDENTIFIER_LENGTH: usize = 63;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing configuration value {0}")]
    Missing(String),

    #[error("invalid configuration value {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// A table name that is safe to interpolate into SQL.
///
/// Accepts `table` or `schema.table`, where each part starts with an ASCII
/// letter or `_`, continues with ASCII letters, digits or `_`, and is at most
/// 63 bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() > 2 || !parts.iter().all(|p| is_identifier(p)) {
            return Err(ConfigError::invalid(
                "table name",
                format!("'{name}' is not a valid SQL identifier"),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TableName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    part.len() <= MAX_IDENTIFIER_LENGTH && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Runtime configuration of the event store, applied-events log and catch-up worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChronicleConfig {
    pub database_url: Option<String>,
    pub events_table: TableName,
    pub applied_events_table: TableName,
    /// How long `reserve` waits for a busy listener before giving up.
    pub reservation_timeout: Duration,
    pub worker_poll_interval: Duration,
    pub worker_max_attempts: u32,
}

impl Default for ChronicleConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            events_table: TableName(DEFAULT_EVENTS_TABLE.to_string()),
            applied_events_table: TableName(DEFAULT_APPLIED_EVENTS_TABLE.to_string()),
            reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
            worker_poll_interval: DEFAULT_WORKER_POLL_INTERVAL,
            worker_max_attempts: DEFAULT_WORKER_MAX_ATTEMPTS,
        }
    }
}

impl ChronicleConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(DATABASE_URL).filter(|v| !v.trim().is_empty()) {
            config.database_url = Some(url);
        }
        if let Some(name) = lookup(EVENTS_TABLE) {
            config.events_table = TableName::new(name).map_err(|e| rekey(e, EVENTS_TABLE))?;
        }
        if let Some(name) = lookup(APPLIED_EVENTS_TABLE) {
            config.applied_events_table =
                TableName::new(name).map_err(|e| rekey(e, APPLIED_EVENTS_TABLE))?;
        }
        if let Some(ms) = lookup(RESERVATION_TIMEOUT_MS) {
            config.reservation_timeout = Duration::from_millis(parse(RESERVATION_TIMEOUT_MS, &ms)?);
        }
        if let Some(ms) = lookup(WORKER_POLL_INTERVAL_MS) {
            config.worker_poll_interval = Duration::from_millis(parse(WORKER_POLL_INTERVAL_MS, &ms)?);
        }
        if let Some(attempts) = lookup(WORKER_MAX_ATTEMPTS) {
            config.worker_max_attempts = parse(WORKER_MAX_ATTEMPTS, &attempts)?;
        }

        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_events_table(mut self, name: impl Into<String>) -> Result<Self, ConfigError> {
        self.events_table = TableName::new(name)?;
        Ok(self)
    }

    pub fn with_applied_events_table(mut self, name: impl Into<String>) -> Result<Self, ConfigError> {
        self.applied_events_table = TableName::new(name)?;
        Ok(self)
    }

    pub fn with_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    pub fn with_worker_max_attempts(mut self, attempts: u32) -> Self {
        self.worker_max_attempts = attempts;
        self
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing(DATABASE_URL.to_string()))
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("'{value}': {e}")))
}

fn rekey(err: ConfigError, key: &str) -> ConfigError {
    match err {
        ConfigError::Invalid { reason, .. } => ConfigError::invalid(key, reason),
        other => other,
    }
}
