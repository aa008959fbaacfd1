//! Client settings.
//!
//! Read from `$XDG_CONFIG_HOME/jazzsync/config.toml` when present, then
//! overridden by `JAZZSYNC_*` environment variables. The binary applies its
//! own flags on top.

use crate::error::{IoContext, Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server used when nothing else is configured
pub const DEFAULT_SERVER_URL: &str = "https://hub.jazz.net/ccm01";

/// Uploads in flight at once during check-in
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 10;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub const ENV_SERVER_URL: &str = "JAZZSYNC_SERVER_URL";
pub const ENV_USER_ID: &str = "JAZZSYNC_USER_ID";
pub const ENV_PASSWORD: &str = "JAZZSYNC_PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the SCM service (the "ccm" application)
    pub server_url: String,

    /// User id for workspace loads and check-ins
    pub user_id: Option<String>,

    /// Maximum concurrent content uploads during check-in
    pub upload_concurrency: usize,

    /// Per-request timeout
    pub timeout_secs: u64,

    /// Never read from or written to the config file
    #[serde(skip)]
    pub password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            user_id: None,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            password: None,
        }
    }
}

impl Settings {
    /// Default config file location (~/.config/jazzsync/config.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("jazzsync").join("config.toml"))
    }

    /// Load settings from the default location and the environment
    pub fn load() -> Result<Self> {
        let mut settings = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML settings file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_path(path)?;
        content.parse()
    }

    /// Apply `JAZZSYNC_*` overrides
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_SERVER_URL) {
            if !url.is_empty() {
                self.server_url = url;
            }
        }
        if let Ok(user) = std::env::var(ENV_USER_ID) {
            if !user.is_empty() {
                self.user_id = Some(user);
            }
        }
        if let Ok(password) = std::env::var(ENV_PASSWORD) {
            if !password.is_empty() {
                self.password = Some(password);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(SyncError::Config("server_url must not be empty".to_string()));
        }
        if self.upload_concurrency == 0 {
            return Err(SyncError::Config(
                "upload_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl std::str::FromStr for Settings {
    type Err = SyncError;

    fn from_str(data: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(data)
            .map_err(|e| SyncError::Config(format!("invalid settings file: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }
}
