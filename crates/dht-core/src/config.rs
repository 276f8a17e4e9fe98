//! The Kademlia-relevant configuration surface. Loading the TOML file
//! itself is `dht-node`'s job; this is the validated shape the core
//! accepts.

use serde::{Deserialize, Serialize};

use crate::error::{DhtError, Result};

/// A bootstrap entry: `(id?, host, port)`. `id` is rarely known in
/// advance, so it's optional; the bootstrap search simply pings the
/// host:port and learns the id from the reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapNode {
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bootstrap_nodes: Vec<BootstrapNode>,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    6881
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            ipv4: true,
            ipv6: false,
            port: default_port(),
            bootstrap_nodes: Vec::new(),
        }
    }
}

impl DhtConfig {
    /// At least one address family must be enabled.
    pub fn validate(&self) -> Result<()> {
        if !self.ipv4 && !self.ipv6 {
            return Err(DhtError::NoAddressFamily);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DhtConfig::default().validate().is_ok());
    }

    #[test]
    fn neither_family_enabled_is_rejected() {
        let config = DhtConfig {
            ipv4: false,
            ipv6: false,
            ..DhtConfig::default()
        };
        assert!(matches!(config.validate(), Err(DhtError::NoAddressFamily)));
    }

    #[test]
    fn dual_stack_is_valid() {
        let config = DhtConfig {
            ipv4: true,
            ipv6: true,
            ..DhtConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
