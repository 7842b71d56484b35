use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default name of the sidecar directory inside the drive
pub const DEFAULT_META_DIR: &str = ".drive";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid ignore pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Tunables of a drive. Every field has a default, so an empty TOML
///  document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// how long a fetch waits for the serving peer to connect
    pub connect_timeout_ms: u64,
    /// bound on a peer refresh before the single fetch retry
    pub refresh_timeout_ms: u64,
    /// pause after a fetch lands, before the watcher is unsuppressed
    pub settle_delay_ms: u64,
    /// how long close waits for in-flight transfers
    pub close_timeout_ms: u64,
    /// check fetched bytes against the requested hash
    pub verify_transfers: bool,
    /// regular expressions; matching filenames are neither indexed nor
    ///  watched
    pub ignore: Vec<String>,
    /// sidecar directory, relative to the drive root
    pub meta_dir: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            refresh_timeout_ms: 5_000,
            settle_delay_ms: 500,
            close_timeout_ms: 10_000,
            verify_transfers: true,
            ignore: Vec::new(),
            meta_dir: DEFAULT_META_DIR.to_string(),
        }
    }
}

impl DriveConfig {
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml)?;
        config.ignore_patterns()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }

    pub fn ignore_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.ignore
            .iter()
            .map(|pattern| Regex::new(pattern).map_err(ConfigError::from))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
