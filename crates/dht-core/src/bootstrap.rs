//! Bootstrap orchestration: for each enabled address family, resolve
//! the configured bootstrap hostnames (dropping unresolved ones without
//! failing the node), then run a `find_node` search targeting the
//! local id, seeded with whatever resolved.
//!
//! Hostname resolution itself is an external collaborator (`dht-node`
//! resolves DNS); this module only consumes already-resolved addresses.

use std::net::SocketAddr;

use crate::id::NodeId;
use crate::search::{Search, SearchKind};
use crate::wire::CompactNode;

/// A bootstrap seed that failed to participate (resolution failure or
/// id unknown) is simply absent from `resolved`; the caller logs the
/// resolution failure before this is ever built.
pub struct BootstrapSeeds {
    pub resolved: Vec<SocketAddr>,
}

/// Build the bootstrap `find_node` search targeting `local_id`. The
/// resolved seeds stand in for `CompactNode`s with a placeholder id of
/// all-zero (bootstrap replies will teach the search their real ids on
/// first response, same as any other `find_node` candidate).
///
/// Returns `None` if no seeds resolved at all — bootstrap is then a
/// no-op this round; the caller may retry later.
pub fn start_bootstrap_search(local_id: NodeId, seeds: &BootstrapSeeds) -> Option<Search> {
    if seeds.resolved.is_empty() {
        return None;
    }
    let start_nodes = seeds
        .resolved
        .iter()
        .map(|addr| CompactNode {
            id: NodeId::ZERO,
            addr: *addr,
        })
        .collect();
    Some(Search::new(local_id, SearchKind::FindNode, start_nodes, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchState;

    #[test]
    fn no_resolved_seeds_returns_none() {
        let seeds = BootstrapSeeds { resolved: Vec::new() };
        assert!(start_bootstrap_search(NodeId::random(), &seeds).is_none());
    }

    #[test]
    fn resolved_seeds_produce_a_find_node_search() {
        let seeds = BootstrapSeeds {
            resolved: vec!["1.2.3.4:6881".parse().expect("valid addr")],
        };
        let mut search = start_bootstrap_search(NodeId::random(), &seeds).expect("search");
        assert_eq!(search.kind, SearchKind::FindNode);
        assert_eq!(search.state(), SearchState::Init);
        assert_eq!(search.next_queries().len(), 1);
    }
}
