//! dht-node: the standalone Mainline DHT node binary.
//!
//! Single OS process running a Tokio async runtime, speaking BEP 5 KRPC
//! over UDP. [`dht_core::server::Server`] is the pure Kademlia state
//! machine; this wires it to real sockets, the wall clock, and the
//! process lifecycle.

mod bootstrap_net;
mod codec;
mod config;
mod error;
mod krpc;
mod net;

use std::path::PathBuf;
use std::time::Duration;

use dht_core::id::NodeId;
use dht_core::server::Server;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::net::Transport;

/// How often `Server::tick` runs: secret rotation, stale-bucket
/// refresh, search timeouts, and announce-store pruning all piggyback
/// on this clock rather than each scheduling their own timer.
const TICK_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = config::load(config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("dht_node={}", config.log_level).parse()?)
                .add_directive(format!("dht_core={}", config.log_level).parse()?),
        )
        .init();

    info!("dht-node starting");

    // Routing-table persistence across restarts is explicitly out of
    // scope: a fresh node id and empty tables every run.
    let local_id = NodeId::random();
    info!(%local_id, port = config.dht.port, ipv4 = config.dht.ipv4, ipv6 = config.dht.ipv6, "local identity generated");

    let mut server = Server::new(&config.dht, local_id)?;
    let transport = Transport::bind(config.dht.port, config.dht.ipv4, config.dht.ipv6).await?;

    if !config.dht.bootstrap_nodes.is_empty() {
        let seeds = bootstrap_net::resolve(&config.dht.bootstrap_nodes).await;
        let count = seeds.resolved.len();
        if server.start_bootstrap(&seeds).is_some() {
            transport.send_all(local_id, server.drain_outbound_queries()).await;
            info!(seeds = count, "bootstrap search started");
        } else {
            warn!("no bootstrap seeds resolved; routing table starts empty");
        }
    }

    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));

    loop {
        tokio::select! {
            result = transport.recv() => {
                match result {
                    Ok((from, msg)) => {
                        let output = server.handle_inbound(from, msg);
                        transport.send_all(local_id, output.outbound).await;
                        transport.send_all(local_id, server.drain_outbound_queries()).await;
                        transport.send_all(local_id, server.drain_announces()).await;
                    }
                    Err(e) => warn!(error = %e, "transport receive error"),
                }
            }
            _ = ticker.tick() => {
                let outbound = server.tick();
                transport.send_all(local_id, outbound).await;
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
        }
    }

    info!("dht-node stopped");
    Ok(())
}
