//! Client configuration management.
//!
//! The configuration names the auth service (base URL, API key, exchange
//! paths) and the storage backend used for the persisted session.
//!
//! Configuration is stored at `~/.config/sessionward/config.json`; the
//! `SESSIONWARD_*` environment variables override individual values.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::exchange::{ExchangeEndpoints, DEFAULT_LOGIN_PATH, DEFAULT_REFRESH_PATH};
use crate::store::{
    EncryptedFilePersistence, FilePersistence, KeyringPersistence, MemoryPersistence,
    SessionPersistence,
};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "sessionward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default path of the logout call
const DEFAULT_LOGOUT_PATH: &str = "/logout";

/// HTTP request timeout in seconds.
/// 30s allows for slow auth servers while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_BASE_URL: &str = "SESSIONWARD_BASE_URL";
pub const ENV_API_KEY: &str = "SESSIONWARD_API_KEY";
pub const ENV_PASSPHRASE: &str = "SESSIONWARD_PASSPHRASE";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Encrypted,
    Memory,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub api_key: Option<String>,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: Option<String>,
    pub request_timeout_secs: u64,
    pub storage: StorageBackend,
    /// Passphrase for encrypted storage; normally supplied via the environment.
    #[serde(skip)]
    pub passphrase: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            logout_path: Some(DEFAULT_LOGOUT_PATH.to_string()),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage: StorageBackend::default(),
            passphrase: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("login_path", &self.login_path)
            .field("refresh_path", &self.refresh_path)
            .field("logout_path", &self.logout_path)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("storage", &self.storage)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override values from an environment lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            self.base_url = base_url;
        }
        if let Some(api_key) = lookup(ENV_API_KEY) {
            self.api_key = Some(api_key);
        }
        if let Some(passphrase) = lookup(ENV_PASSPHRASE) {
            self.passphrase = Some(passphrase);
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No API key configured (set {})", ENV_API_KEY))
    }

    pub fn endpoints(&self) -> ExchangeEndpoints {
        ExchangeEndpoints {
            login_path: self.login_path.clone(),
            refresh_path: self.refresh_path.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the configured persistence backend, rooted at `dir` for the
    /// file-based ones.
    pub fn persistence_in(&self, dir: &Path) -> Result<Arc<dyn SessionPersistence>> {
        Ok(match self.storage {
            StorageBackend::File => Arc::new(FilePersistence::new(dir)),
            StorageBackend::Keyring => Arc::new(KeyringPersistence::new(APP_NAME)),
            StorageBackend::Encrypted => {
                let passphrase = self.passphrase.clone().ok_or_else(|| {
                    anyhow::anyhow!("Encrypted storage requires {}", ENV_PASSPHRASE)
                })?;
                Arc::new(EncryptedFilePersistence::new(dir, passphrase))
            }
            StorageBackend::Memory => Arc::new(MemoryPersistence::new()),
        })
    }

    pub fn persistence(&self) -> Result<Arc<dyn SessionPersistence>> {
        self.persistence_in(&self.data_dir()?)
    }
}
