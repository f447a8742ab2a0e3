//! Application configuration management.
//!
//! Configuration is stored at `~/.config/toji/config.json`. Every field is
//! optional on disk; missing values fall back to the defaults below. On first
//! run the defaults are written out so there is a file to edit. The
//! `TOJI_API_URL` environment variable overrides `api_url`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::DEFAULT_API_URL;
use crate::auth::{FileTokenStore, GuardOptions, KeyringTokenStore, TokenStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "toji";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the backend URL
pub const API_URL_ENV: &str = "TOJI_API_URL";

/// Where the session token is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    File,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub store: StoreKind,
    pub soft_check_timeout_secs: u64,
    pub validation_timeout_secs: u64,
    pub default_lifetime_secs: u64,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let options = GuardOptions::default();
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            store: StoreKind::default(),
            soft_check_timeout_secs: options.soft_check_timeout.as_secs(),
            validation_timeout_secs: options.validation_timeout.as_secs(),
            default_lifetime_secs: options.default_lifetime.as_secs(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load from disk (or defaults), then apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(std::env::var(API_URL_ENV).ok());
        Ok(config)
    }

    /// Read `path`, or write and return the defaults if it does not exist.
    /// Failing to write the defaults is not fatal.
    fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&contents)?);
        }

        let config = Self::default();
        match config.save_to(path) {
            Ok(()) => debug!(path = %path.display(), "Wrote default configuration"),
            Err(e) => warn!(error = %e, "Failed to write default configuration"),
        }
        Ok(config)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self, api_url: Option<String>) {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            self.api_url = url;
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn guard_options(&self) -> GuardOptions {
        GuardOptions {
            soft_check_timeout: Duration::from_secs(self.soft_check_timeout_secs),
            validation_timeout: Duration::from_secs(self.validation_timeout_secs),
            default_lifetime: Duration::from_secs(self.default_lifetime_secs),
            ..GuardOptions::default()
        }
    }

    /// Build the configured token store
    pub fn token_store(&self) -> Result<Arc<dyn TokenStore>> {
        Ok(match self.store {
            StoreKind::File => Arc::new(FileTokenStore::new(self.cache_dir()?)),
            StoreKind::Keyring => Arc::new(KeyringTokenStore::new()),
        })
    }
}
