//! TOML config file loading. The validated Kademlia surface itself is
//! [`dht_core::config::DhtConfig`]; this module adds the process-level
//! fields (`data_dir`, `log_level`) alongside it and knows how to find
//! the file on disk and parse it.

use std::path::PathBuf;

use dht_core::config::DhtConfig;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Complete `dht-node` configuration: the Kademlia surface `dht-core`
/// validates, plus ambient process settings it has no opinion on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(flatten)]
    pub dht: DhtConfig,
    /// Directory for future on-disk state. Unused today — routing-table
    /// persistence is a non-goal — but reserved ahead of any feature
    /// that ends up needing it.
    #[serde(default)]
    pub data_dir: String,
    /// `"trace"|"debug"|"info"|"warn"|"error"`, fed to `EnvFilter`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig { dht: DhtConfig::default(), data_dir: String::new(), log_level: default_log_level() }
    }
}

/// Loads `NodeConfig` from the given path, or from the platform default
/// location if `path` is `None`. Falls back to [`NodeConfig::default`]
/// if no file exists at all — a fresh node should still start.
pub fn load(path: Option<PathBuf>) -> Result<NodeConfig> {
    let path = path.unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(NodeConfig::default());
    }
    let content = std::fs::read_to_string(&path).map_err(|source| NodeError::ConfigRead {
        path: path.display().to_string(),
        source,
    })?;
    let config: NodeConfig = toml::from_str(&content).map_err(|source| NodeError::ConfigParse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(config)
}

fn default_config_path() -> PathBuf {
    if let Ok(dir) = std::env::var("DHT_NODE_DATA_DIR") {
        return PathBuf::from(dir).join("config.toml");
    }
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".dht-node").join("config.toml"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/dht-node/config.toml"))
}
