//! Configuration at ~/.config/calsync/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{
    DEFAULT_MAX_INSTANCES, DEFAULT_MAX_RETRIES, DEFAULT_MULTIGET_BATCH_SIZE,
    DEFAULT_PARSE_FAILURE_THRESHOLD, DEFAULT_SYNC_DAYS,
};
use crate::error::{CalSyncError, CalSyncResult};
use crate::pending::Backoff;

static DEFAULT_DATA_DIR: &str = "~/.local/share/calsync";

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalsyncConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for CalsyncConfig {
    fn default() -> Self {
        CalsyncConfig {
            data_dir: default_data_dir(),
            sync: SyncConfig::default(),
            accounts: Vec::new(),
        }
    }
}

/// Knobs of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub past_days: i64,
    pub future_days: i64,
    pub max_instances: u16,
    pub multiget_batch_size: usize,
    pub parse_failure_threshold: u32,
    #[serde(with = "human_duration")]
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            past_days: DEFAULT_SYNC_DAYS,
            future_days: DEFAULT_SYNC_DAYS,
            max_instances: DEFAULT_MAX_INSTANCES,
            multiget_batch_size: DEFAULT_MULTIGET_BATCH_SIZE,
            parse_failure_threshold: DEFAULT_PARSE_FAILURE_THRESHOLD,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "human_duration")]
    pub base_delay: Duration,
    #[serde(with = "human_duration")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: self.base_delay,
            max: self.max_delay,
        }
    }
}

/// A CalDAV account to sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// Server URL used as the discovery starting point
    pub url: String,
    pub username: String,
    /// Name of the environment variable holding the password
    pub password_env: String,
    /// Force a server vendor instead of detecting it from the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

impl AccountConfig {
    pub fn password(&self) -> CalSyncResult<String> {
        std::env::var(&self.password_env).map_err(|_| {
            CalSyncError::Config(format!(
                "Environment variable {} (password for account '{}') is not set",
                self.password_env, self.name
            ))
        })
    }
}

impl CalsyncConfig {
    pub fn config_path() -> CalSyncResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| CalSyncError::Config("Could not determine config directory".into()))?
            .join("calsync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load from the default location, creating a commented default file first if needed.
    pub fn load() -> CalSyncResult<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)?;
        }

        Self::load_from(&config_path)
    }

    /// Load from `path`, with `CALSYNC_` environment variables taking precedence
    /// (`CALSYNC_SYNC__PAST_DAYS=30`).
    pub fn load_from(path: &Path) -> CalSyncResult<Self> {
        Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(Environment::with_prefix("CALSYNC").separator("__"))
            .build()
            .map_err(|e| CalSyncError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CalSyncError::Config(e.to_string()))
    }

    pub fn data_path(&self) -> PathBuf {
        let full_path_str = shellexpand::tilde(&self.data_dir.to_string_lossy()).into_owned();
        PathBuf::from(full_path_str)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_path().join("state.json")
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &Path) -> CalSyncResult<()> {
        let contents = format!(
            "\
# calsync configuration

# Where local state is kept:
# data_dir = \"{}\"

# [sync]
# past_days = {days}
# future_days = {days}
# request_timeout = \"30s\"
#
# [sync.retry]
# max_retries = {retries}
# base_delay = \"30s\"
# max_delay = \"1h\"

# [[accounts]]
# name = \"personal\"
# url = \"https://caldav.example.com/\"
# username = \"me@example.com\"
# password_env = \"CALSYNC_PERSONAL_PASSWORD\"
",
            DEFAULT_DATA_DIR,
            days = DEFAULT_SYNC_DAYS,
            retries = DEFAULT_MAX_RETRIES,
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CalSyncError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| CalSyncError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }
}

/// Durations written as `"30s"`, `"5m"`, `"1h 30m"`.
mod human_duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
