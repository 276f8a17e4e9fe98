//! Resolves the configured bootstrap hostnames to addresses. Everything
//! downstream of resolution — seeding and running the bootstrap
//! `find_node` search — is `dht_core::bootstrap`'s job; this module is
//! only the DNS lookup `dht-core` deliberately doesn't own.

use dht_core::bootstrap::BootstrapSeeds;
use dht_core::config::BootstrapNode;
use tokio::net::lookup_host;
use tracing::warn;

/// Resolves each `host:port` via the system resolver, dropping (and
/// logging) any that fail rather than failing bootstrap outright: an
/// unresolvable seed is a non-fatal warning, not a startup error.
pub async fn resolve(nodes: &[BootstrapNode]) -> BootstrapSeeds {
    let mut resolved = Vec::new();
    for node in nodes {
        let query = format!("{}:{}", node.host, node.port);
        match lookup_host(&query).await {
            Ok(addrs) => {
                if let Some(addr) = addrs.into_iter().next() {
                    resolved.push(addr);
                } else {
                    warn!(host = %node.host, "bootstrap host resolved to no addresses");
                }
            }
            Err(e) => {
                warn!(host = %node.host, error = %e, "failed to resolve bootstrap host");
            }
        }
    }
    BootstrapSeeds { resolved }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_bootstrap_nodes_resolves_empty() {
        let seeds = resolve(&[]).await;
        assert!(seeds.resolved.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_host_is_dropped_not_fatal() {
        let nodes = vec![BootstrapNode {
            id: None,
            host: "this-host-should-not-resolve.invalid".to_string(),
            port: 6881,
        }];
        let seeds = resolve(&nodes).await;
        assert!(seeds.resolved.is_empty());
    }

    #[tokio::test]
    async fn loopback_resolves_to_an_address() {
        let nodes = vec![BootstrapNode { id: None, host: "localhost".to_string(), port: 6881 }];
        let seeds = resolve(&nodes).await;
        assert_eq!(seeds.resolved.len(), 1);
    }
}
