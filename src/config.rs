//! Configuration loading and management
//!
//! Handles parsing of `config.toml`. The storage mode is fixed for the
//! lifetime of a session; everything else has a default.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reorder::DEFAULT_STEP;

/// File name of the configuration inside the config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Which backend a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Local,
    Remote,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend selection
    #[serde(default)]
    pub mode: StorageMode,

    /// Local embedded database
    #[serde(default)]
    pub local: LocalConfig,

    /// Remote service session
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Manual ordering
    #[serde(default)]
    pub ordering: OrderingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocalConfig {
    /// SQLite database file; defaults to the platform data dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,

    /// Check-in log; defaults to the platform data dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Signed-in user id; absent means an anonymous session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Max project ids per change-subscription filter
    #[serde(default = "default_subscription_chunk_size")]
    pub subscription_chunk_size: usize,
}

fn default_subscription_chunk_size() -> usize {
    50
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            subscription_chunk_size: default_subscription_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderingConfig {
    /// Gap used when a moved item has a single neighbour
    #[serde(default = "default_step")]
    pub step: f64,
}

fn default_step() -> f64 {
    DEFAULT_STEP
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            step: default_step(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "snail", "snail")
}

/// Default location of `config.toml`
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    /// Load and validate configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, or return defaults when missing or invalid
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring invalid config");
                Self::default()
            }
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        crate::lock::write_atomic(path, content.as_bytes())
    }

    pub fn db_path(&self) -> PathBuf {
        self.local
            .db_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("snail.db"))
    }

    pub fn checkin_path(&self) -> PathBuf {
        self.local
            .checkin_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("checkins.json"))
    }

    fn validate(&self) -> Result<()> {
        if !self.ordering.step.is_finite() || self.ordering.step <= 0.0 {
            return Err(Error::InvalidConfig(
                "ordering.step must be a positive number".to_string(),
            ));
        }
        if self.remote.subscription_chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "remote.subscription_chunk_size must be >= 1".to_string(),
            ));
        }
        if let Some(user_id) = &self.remote.user_id {
            if user_id.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "remote.user_id cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
