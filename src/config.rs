//! Static configuration, read once at startup
//!
//! ```toml
//! [controller]
//! acquire_timeout_ms = 1000
//! device_name = "Nintendo Wii Remote"
//!
//! [remote]
//! host = "127.0.0.1"
//! port = 6546
//!
//! [dispatcher]
//! idle_timeout_ms = 60000
//! ```
//!
//! Every key is optional. A missing file means defaults throughout.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::controller::ControllerSettings;
use crate::dispatcher::DispatcherSettings;
use crate::remote::LinkSettings;

/// Overrides the config file location when set
pub const CONFIG_ENV: &str = "MYTHMOTE_CONFIG";
const CONFIG_DIR: &str = ".config/mythmote";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    pub controller: ControllerSettings,
    pub remote: LinkSettings,
    pub dispatcher: DispatcherSettings,
}

impl BridgeConfig {
    /// Loads from `$MYTHMOTE_CONFIG` or the default location
    pub async fn load() -> Result<Self> {
        let path = resolve_path(std::env::var(CONFIG_ENV).ok());
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?;
        if !exists {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: BridgeConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;

        debug!("Loaded configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }
}

fn resolve_path(from_env: Option<String>) -> PathBuf {
    match from_env {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => default_path(),
    }
}

pub fn default_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}
