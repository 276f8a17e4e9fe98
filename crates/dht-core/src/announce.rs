//! The peer-announce store: `infohash -> set<PeerEntry>`, pruned lazily
//! on read.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::id::NodeId;
use crate::PEER_ANNOUNCE_TTL_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerEntryKey {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    expiry: Instant,
}

#[derive(Default)]
pub struct AnnounceStore {
    peers: HashMap<NodeId, HashMap<PeerEntryKey, PeerEntry>>,
}

impl AnnounceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an announce; resets expiry to now + 30 minutes.
    pub fn put(&mut self, infohash: NodeId, ip: IpAddr, port: u16) {
        let expiry = Instant::now() + Duration::from_secs(PEER_ANNOUNCE_TTL_SECS);
        self.peers
            .entry(infohash)
            .or_default()
            .insert(PeerEntryKey { ip, port }, PeerEntry { expiry });
    }

    /// Live (unexpired) peers for `infohash`, pruning expired entries
    /// from the underlying map as a side effect.
    pub fn get(&mut self, infohash: &NodeId) -> Vec<(IpAddr, u16)> {
        let now = Instant::now();
        let Some(set) = self.peers.get_mut(infohash) else {
            return Vec::new();
        };
        set.retain(|_, entry| entry.expiry > now);
        let result = set.keys().map(|k| (k.ip, k.port)).collect();
        if set.is_empty() {
            self.peers.remove(infohash);
        }
        result
    }

    pub fn has_peers(&mut self, infohash: &NodeId) -> bool {
        !self.get(infohash).is_empty()
    }

    /// Sweeps every infohash's set, dropping expired entries. Intended
    /// to be called by the glue layer's once-a-minute timer in addition
    /// to the lazy pruning `get` already does.
    pub fn prune_expired(&mut self) {
        let now = Instant::now();
        self.peers.retain(|_, set| {
            set.retain(|_, entry| entry.expiry > now);
            !set.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))
    }

    #[test]
    fn put_then_get_returns_peer() {
        let mut store = AnnounceStore::new();
        let infohash = NodeId::random();
        store.put(infohash, ip(), 6881);
        let peers = store.get(&infohash);
        assert_eq!(peers, vec![(ip(), 6881)]);
    }

    #[test]
    fn unknown_infohash_returns_empty() {
        let mut store = AnnounceStore::new();
        assert!(store.get(&NodeId::random()).is_empty());
    }

    #[test]
    fn has_peers_matches_get() {
        let mut store = AnnounceStore::new();
        let infohash = NodeId::random();
        assert!(!store.has_peers(&infohash));
        store.put(infohash, ip(), 6881);
        assert!(store.has_peers(&infohash));
    }

    #[test]
    fn expired_entries_are_pruned_on_read() {
        let mut store = AnnounceStore::new();
        let infohash = NodeId::random();
        store.put(infohash, ip(), 6881);
        // Manually backdate the entry's expiry to simulate 30+ minutes
        // having elapsed, without sleeping the test.
        if let Some(set) = store.peers.get_mut(&infohash) {
            for entry in set.values_mut() {
                entry.expiry = Instant::now() - Duration::from_secs(1);
            }
        }
        assert!(store.get(&infohash).is_empty());
    }
}
