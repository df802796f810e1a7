//! Configuration types for the exit-queue monitor.
//!
//! Connection settings normally come from the environment (see the binary's
//! CLI); the optional TOML file only carries tuning knobs and may also set
//! the connection settings for local runs.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use exit_queue_types::{SECONDS_PER_SLOT, SLOTS_PER_EPOCH};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Monitor configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Beacon node REST endpoint.
    pub beacon_api_url: Option<Url>,
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Poll cadence settings.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Beacon client request settings.
    #[serde(default)]
    pub beacon: BeaconConfig,
}

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("validator_exits.sqlite3")
}

/// Poll cadence configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    /// Maximum age of the shared head observation.
    pub head_cache_ttl_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            seconds_per_slot: SECONDS_PER_SLOT,
            slots_per_epoch: SLOTS_PER_EPOCH,
            head_cache_ttl_secs: SECONDS_PER_SLOT,
        }
    }
}

impl PollingConfig {
    pub fn slot_duration(&self) -> Duration {
        Duration::from_secs(self.seconds_per_slot)
    }

    pub fn epoch_duration(&self) -> Duration {
        Duration::from_secs(self.seconds_per_slot * self.slots_per_epoch)
    }

    pub fn head_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.head_cache_ttl_secs)
    }
}

/// Beacon client configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Requests admitted per rate-limit period.
    pub max_requests_per_period: usize,
    pub rate_limit_period_ms: u64,
    /// Retries of a failed request before giving up on it.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            max_requests_per_period: 15,
            rate_limit_period_ms: 1000,
            max_retries: 2,
            retry_delay_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml_edit::de::from_str(s)?)
    }

    /// Check that everything needed to start is present and sane.
    pub fn validate(&self) -> Result<&Url> {
        let Some(url) = &self.beacon_api_url else {
            return Err(Error::Config("BEACON_API_URL is not set".to_string()));
        };
        if self.polling.seconds_per_slot == 0 || self.polling.slots_per_epoch == 0 {
            return Err(Error::Config(
                "slot duration and epoch length must be non-zero".to_string(),
            ));
        }
        if self.beacon.max_requests_per_period == 0 {
            return Err(Error::Config(
                "beacon.max_requests_per_period must be non-zero".to_string(),
            ));
        }
        Ok(url)
    }
}
