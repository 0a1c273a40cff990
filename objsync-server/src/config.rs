//! Server configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Server configuration, loadable from a TOML file; CLI flags override
/// individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., 0.0.0.0:9100).
    pub addr: String,
    /// Directory for the persistent store.
    pub data_dir: String,
    /// Use the in-memory store instead of the persistent one.
    pub memory: bool,
    /// How many committed ops each object retains for catch-up replay.
    pub replay_window: usize,
    /// Enable debug logging.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:9100".to_string(),
            data_dir: "./data/objsync".to_string(),
            memory: false,
            replay_window: 64,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: ServerConfig =
            toml::from_str(&raw).with_context(|| "Failed to parse config TOML")?;
        Ok(config)
    }
}
