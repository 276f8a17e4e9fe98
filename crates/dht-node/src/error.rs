//! Errors specific to running the DHT over a real socket: everything
//! `dht-core` itself can raise is a [`dht_core::DhtError`]; this adds the
//! transport- and config-loading failures around it.

use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("dht error: {0}")]
    Dht(#[from] dht_core::DhtError),

    #[error("failed to bind udp socket on {addr}: {source}")]
    SocketBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("udp send/recv failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
