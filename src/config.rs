//! Typed settings persisted in the store's config table.
//!
//! The key set is closed: unknown keys are rejected at `set` time, and values
//! are validated before they are written.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::store::Store;

pub const KEY_MAX_RETRIES: &str = "max-retries";
pub const KEY_BACKOFF_BASE: &str = "backoff-base";
pub const KEY_POLL_INTERVAL: &str = "poll-interval-seconds";
pub const KEY_STUCK_TIMEOUT: &str = "stuck-timeout-seconds";

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: u32 = 2;
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;
pub const DEFAULT_STUCK_TIMEOUT_SECS: u64 = 3600;

/// Seeded into a fresh store; `INSERT OR IGNORE` keeps existing values.
pub const DEFAULTS: [(&str, &str); 4] = [
    (KEY_MAX_RETRIES, "3"),
    (KEY_BACKOFF_BASE, "2"),
    (KEY_POLL_INTERVAL, "1"),
    (KEY_STUCK_TIMEOUT, "3600"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    PollInterval,
    StuckTimeout,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => KEY_MAX_RETRIES,
            ConfigKey::BackoffBase => KEY_BACKOFF_BASE,
            ConfigKey::PollInterval => KEY_POLL_INTERVAL,
            ConfigKey::StuckTimeout => KEY_STUCK_TIMEOUT,
        }
    }

    /// Parse and range-check a candidate value for this key.
    pub fn validate(&self, value: &str) -> Result<()> {
        let invalid = |reason: String| QueueError::InvalidConfigValue {
            key: self.as_str().to_string(),
            reason,
        };
        match self {
            ConfigKey::MaxRetries | ConfigKey::StuckTimeout => {
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| invalid(format!("expected a non-negative integer, got {value}")))?;
            }
            ConfigKey::BackoffBase => {
                let n: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("expected an integer >= 1, got {value}")))?;
                if n < 1 {
                    return Err(invalid("must be >= 1".to_string()));
                }
            }
            ConfigKey::PollInterval => {
                let n: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("expected a number > 0, got {value}")))?;
                if !n.is_finite() || n <= 0.0 {
                    return Err(invalid("must be > 0".to_string()));
                }
            }
        }
        Ok(())
    }
}

impl FromStr for ConfigKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            KEY_MAX_RETRIES => Ok(ConfigKey::MaxRetries),
            KEY_BACKOFF_BASE => Ok(ConfigKey::BackoffBase),
            KEY_POLL_INTERVAL => Ok(ConfigKey::PollInterval),
            KEY_STUCK_TIMEOUT => Ok(ConfigKey::StuckTimeout),
            other => Err(QueueError::UnknownConfigKey(other.to_string())),
        }
    }
}

/// Validate and persist a value for a known key.
pub fn set(store: &Store, key: &str, value: &str) -> Result<()> {
    let key: ConfigKey = key.parse()?;
    key.validate(value)?;
    store.config_set(key.as_str(), value.trim())
}

/// Current value for a known key (the seeded default if never set).
pub fn get(store: &Store, key: &str) -> Result<String> {
    let key: ConfigKey = key.parse()?;
    let stored = store.config_get(key.as_str())?;
    Ok(stored.unwrap_or_else(|| default_for(key).to_string()))
}

fn default_for(key: ConfigKey) -> &'static str {
    DEFAULTS
        .iter()
        .find(|(k, _)| *k == key.as_str())
        .map(|(_, v)| *v)
        .unwrap_or("")
}

fn parsed<T: FromStr>(store: &Store, key: ConfigKey) -> Result<T> {
    let raw = get(store, key.as_str())?;
    raw.trim()
        .parse()
        .map_err(|_| QueueError::InvalidConfigValue {
            key: key.as_str().to_string(),
            reason: format!("stored value is not parseable: {raw}"),
        })
}

pub fn max_retries(store: &Store) -> Result<u32> {
    parsed(store, ConfigKey::MaxRetries)
}

pub fn backoff_base(store: &Store) -> Result<u32> {
    parsed(store, ConfigKey::BackoffBase)
}

pub fn poll_interval(store: &Store) -> Result<Duration> {
    let secs: f64 = parsed(store, ConfigKey::PollInterval)?;
    Ok(Duration::from_secs_f64(secs))
}

pub fn stuck_timeout(store: &Store) -> Result<Duration> {
    let secs: u64 = parsed(store, ConfigKey::StuckTimeout)?;
    Ok(Duration::from_secs(secs))
}
