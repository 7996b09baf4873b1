//! Application configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the API base URL, request timeout, where credentials are kept,
//! and the auth endpoint paths.
//!
//! Configuration is stored at `~/.config/marketdesk/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "marketdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default API base URL
const DEFAULT_BASE_URL: &str = "https://localhost:7220";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Environment variable overriding `base_url`
pub const ENV_BASE_URL: &str = "MARKETDESK_BASE_URL";

/// Environment variable overriding `store`
pub const ENV_STORE: &str = "MARKETDESK_STORE";

/// Where the session's credentials are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StoreBackend::File),
            "keyring" => Ok(StoreBackend::Keyring),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!("Unknown credential store backend: {}", other),
        }
    }
}

/// Paths of the auth endpoints, relative to `base_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEndpoints {
    pub login: String,
    pub register: String,
    pub complete_registration: String,
    pub confirm_email: String,
    pub refresh: String,
    pub logout: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/api/login/".to_string(),
            register: "/api/register/".to_string(),
            complete_registration: "/api/register/step-two".to_string(),
            confirm_email: "/api/confirm_email/".to_string(),
            refresh: "/api/refresh/".to_string(),
            logout: "/api/logout/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub store: StoreBackend,
    pub log_dir: Option<PathBuf>,
    pub endpoints: AuthEndpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            store: StoreBackend::default(),
            log_dir: None,
            endpoints: AuthEndpoints::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        debug!(base_url = %config.base_url, store = ?config.store, "Configuration loaded");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `MARKETDESK_*` overrides. Takes a lookup so tests need not touch
    /// the process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(store) = lookup(ENV_STORE).filter(|v| !v.trim().is_empty()) {
            self.store = store.parse()?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the file-backed credential store.
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
