//! Application configuration management.
//!
//! This module handles loading and saving the configuration, which includes
//! the API base URL, the credential storage backend, and session timeouts.
//!
//! Configuration is stored at `~/.config/authkeep/config.json`; environment
//! variables (`AUTHKEEP_API_URL`, `AUTHKEEP_STORAGE`) override it.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};

/// Application name used for config/data directory paths
const APP_NAME: &str = "authkeep";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Credential file name for the `file` storage backend
const CREDENTIALS_FILE: &str = "credentials.json";

/// Upper bound on session initialization before falling back to signed out.
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 5000;

/// Upper bound on a single refresh request.
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_SIGN_IN_ROUTE: &str = "/sign-in";

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "keyring" | "keychain" => Ok(Self::Keyring),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub storage: StorageBackend,
    pub refresh_timeout_secs: u64,
    pub init_timeout_ms: u64,
    pub sign_in_route: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            storage: StorageBackend::default(),
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            sign_in_route: DEFAULT_SIGN_IN_ROUTE.to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
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

    /// Apply `AUTHKEEP_*` environment overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("AUTHKEEP_API_URL").filter(|u| !u.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(storage) = lookup("AUTHKEEP_STORAGE") {
            self.storage = storage.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn credentials_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(CREDENTIALS_FILE))
    }

    /// Open the configured credential storage backend.
    pub fn open_storage(&self) -> Result<Arc<dyn KeyValueStore>> {
        Ok(match self.storage {
            StorageBackend::File => Arc::new(FileStore::new(Self::credentials_path()?)),
            StorageBackend::Keyring => Arc::new(KeyringStore::new(APP_NAME)),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
            sign_in_route: self.sign_in_route.clone(),
        }
    }
}

/// Runtime knobs for the session services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Initialization never leaves the session `Initializing` longer than this.
    pub init_timeout: Duration,
    pub refresh_timeout: Duration,
    /// Where guarded routes send callers who may not proceed.
    pub sign_in_route: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Config::default().session_config()
    }
}
