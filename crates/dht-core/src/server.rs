//! The server loop's dispatch table and transaction-id routing.
//! `Server` is pure state: it consumes inbound messages and
//! produces outbound ones, owning the routing tables, announce store,
//! secrets, and in-flight searches. The socket itself, and the bencode
//! codec, live in `dht-node`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::announce::AnnounceStore;
use crate::bootstrap::{self, BootstrapSeeds};
use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::id::NodeId;
use crate::node::{NodeRecord, SocketFamily};
use crate::search::{QueryKind, Search, SearchKind, SearchState};
use crate::table::{AddOutcome, RoutingTable};
use crate::token::SecretManager;
use crate::wire::{CompactNode, InboundMessage, OutboundMessage, TransactionId};
use crate::{K, QUERY_TIMEOUT_SECS};

pub type SearchId = u64;

/// Callback invoked once per peer discovered by a `get_peers` search.
pub type PeerCallback = Box<dyn FnMut(SocketAddr) + Send>;

enum PendingRoute {
    /// Tracks an outstanding query issued on behalf of a `Search`.
    SearchQuery { search_id: SearchId },
    /// Tracks the "ping the most-questionable node" probe from
    /// `RoutingTable::add`'s `NeedsPing` outcome. If it times out or
    /// errors, the candidate is evicted in favor of `new_node`.
    EvictionPing { family: SocketFamily, stale_id: NodeId, new_node: NodeRecord, sent_at: Instant },
    /// An `announce_peer` sent fire-and-forget; any reply (or none at
    /// all) is simply discarded.
    AnnounceFired,
}

struct SearchEntry {
    search: Search,
    callback: Option<PeerCallback>,
}

/// Effects the caller must execute: outbound datagrams to send, and
/// peers from a `get_peers` search just delivered to its callback (the
/// callback already ran; this is only surfaced for observability/tests).
#[derive(Default)]
pub struct DispatchOutput {
    pub outbound: Vec<(SocketAddr, OutboundMessage)>,
    pub delivered_peers: Vec<SocketAddr>,
}

pub struct Server {
    local_id: NodeId,
    table_v4: Option<RoutingTable>,
    table_v6: Option<RoutingTable>,
    announce_store: AnnounceStore,
    secrets: SecretManager,
    searches: HashMap<SearchId, SearchEntry>,
    next_search_id: SearchId,
    next_tid: u16,
    pending: HashMap<Vec<u8>, PendingRoute>,
}

impl Server {
    pub fn new(config: &DhtConfig, local_id: NodeId) -> Result<Self> {
        config.validate()?;
        Ok(Server {
            local_id,
            table_v4: config.ipv4.then(|| RoutingTable::new(local_id)),
            table_v6: config.ipv6.then(|| RoutingTable::new(local_id)),
            announce_store: AnnounceStore::new(),
            secrets: SecretManager::new(),
            searches: HashMap::new(),
            next_search_id: 0,
            next_tid: 0,
            pending: HashMap::new(),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn table_for_family(&mut self, family: SocketFamily) -> Option<&mut RoutingTable> {
        match family {
            SocketFamily::V4 => self.table_v4.as_mut(),
            SocketFamily::V6 => self.table_v6.as_mut(),
        }
    }

    fn table_for_addr(&mut self, addr: SocketAddr) -> Option<&mut RoutingTable> {
        self.table_for_family(family_of(addr))
    }

    fn alloc_tid(&mut self) -> TransactionId {
        let tid = self.next_tid.to_be_bytes().to_vec();
        self.next_tid = self.next_tid.wrapping_add(1);
        TransactionId(tid)
    }

    /// Start a new search; seeds it from the closest known nodes in the
    /// relevant routing table(s), falling back to caller-supplied seeds
    /// (bootstrap) when the table is empty.
    pub fn start_search(
        &mut self,
        target: NodeId,
        kind: SearchKind,
        announce_port: Option<u16>,
        seed_nodes: Vec<CompactNode>,
        callback: Option<PeerCallback>,
    ) -> SearchId {
        let mut start_nodes = seed_nodes;
        if let Some(table) = &self.table_v4 {
            start_nodes.extend(table.closest_nodes(&target, K).into_iter().map(record_to_compact));
        }
        if let Some(table) = &self.table_v6 {
            start_nodes.extend(table.closest_nodes(&target, K).into_iter().map(record_to_compact));
        }
        let search = Search::new(target, kind, start_nodes, announce_port);
        self.insert_search(search, callback)
    }

    /// Looks up the peers currently announcing `infohash`. Thin wrapper
    /// over [`Server::start_search`] with no announce phase.
    pub fn search(&mut self, infohash: NodeId, callback: Option<PeerCallback>) -> SearchId {
        self.start_search(infohash, SearchKind::GetPeers, None, Vec::new(), callback)
    }

    /// Looks up peers for `infohash`, then announces this node as a peer
    /// on `port` once the lookup converges.
    pub fn search_announce(&mut self, infohash: NodeId, port: u16, callback: Option<PeerCallback>) -> SearchId {
        self.start_search(infohash, SearchKind::GetPeers, Some(port), Vec::new(), callback)
    }

    /// Starts the bootstrap `find_node` search from already-resolved
    /// seed addresses (`dht-node` owns DNS resolution; this only adopts
    /// the `Search` [`bootstrap::start_bootstrap_search`] builds from it).
    /// Returns `None` if nothing resolved this round.
    pub fn start_bootstrap(&mut self, seeds: &BootstrapSeeds) -> Option<SearchId> {
        let search = bootstrap::start_bootstrap_search(self.local_id, seeds)?;
        Some(self.insert_search(search, None))
    }

    fn insert_search(&mut self, search: Search, callback: Option<PeerCallback>) -> SearchId {
        let id = self.next_search_id;
        self.next_search_id += 1;
        self.searches.insert(id, SearchEntry { search, callback });
        id
    }

    pub fn cancel_search(&mut self, id: SearchId) {
        if let Some(entry) = self.searches.get_mut(&id) {
            entry.search.cancel();
        }
    }

    pub fn search_state(&self, id: SearchId) -> Option<SearchState> {
        self.searches.get(&id).map(|e| e.search.state())
    }

    /// Pulls the next batch of queries each active search wants to send,
    /// registers them for transaction-id routing, and returns the
    /// outbound datagrams.
    pub fn drain_outbound_queries(&mut self) -> Vec<(SocketAddr, OutboundMessage)> {
        let mut out = Vec::new();
        let search_ids: Vec<SearchId> = self.searches.keys().copied().collect();
        for search_id in search_ids {
            let (queries, search_target) = {
                let entry = self.searches.get_mut(&search_id).expect("search exists");
                (entry.search.next_queries(), entry.search.target)
            };
            for (target_id, addr, kind) in queries {
                if let Some(table) = self.table_for_addr(addr) {
                    table.touch_query_sent(&target_id);
                }
                let tid = self.alloc_tid();
                self.pending
                    .insert(tid.0.clone(), PendingRoute::SearchQuery { search_id });
                let msg = match kind {
                    QueryKind::FindNode => OutboundMessage::FindNode {
                        tid,
                        target: search_target,
                        want_v6: self.table_v6.is_some(),
                    },
                    QueryKind::GetPeers => OutboundMessage::GetPeers {
                        tid,
                        infohash: search_target,
                        want_v6: self.table_v6.is_some(),
                    },
                };
                out.push((addr, msg));
            }
        }
        out
    }

    /// Announce-phase messages for any search that just converged into
    /// `Announce`. Call after processing a batch of responses.
    pub fn drain_announces(&mut self) -> Vec<(SocketAddr, OutboundMessage)> {
        let mut out = Vec::new();
        for entry in self.searches.values_mut() {
            for (_, addr, token) in entry.search.take_announce_targets() {
                out.push((
                    addr,
                    OutboundMessage::AnnouncePeer {
                        tid: TransactionId(Vec::new()), // allocated below
                        infohash: entry.search.target,
                        port: entry.search.announce_port.unwrap_or(0),
                        implied_port: entry.search.announce_port.is_none(),
                        token,
                    },
                ));
            }
        }
        // Transaction ids are allocated here, not inside the loop above, to
        // keep the borrow checker happy with `self.alloc_tid()`.
        for (_, msg) in out.iter_mut() {
            if let OutboundMessage::AnnouncePeer { tid, .. } = msg {
                *tid = self.alloc_tid();
                // Announces are fire-and-forget: there's no
                // search left to route a reply back to, so this is tracked
                // under no owning search. A stray ping_reply sharing this
                // tid is simply ignored by `route_eviction_ping`.
                self.pending.insert(tid.0.clone(), PendingRoute::AnnounceFired);
            }
        }
        out
    }

    /// Drops completed/cancelled/timed-out searches. Call periodically.
    pub fn reap_finished_searches(&mut self) {
        self.searches.retain(|_, entry| {
            !matches!(
                entry.search.state(),
                SearchState::Done | SearchState::Cancelled | SearchState::TimedOut
            )
        });
    }

    /// Periodic glue: secret rotation, search timeouts, stale-bucket
    /// refresh, and announce-store pruning, all sharing one clock.
    /// Returns any outbound datagrams this produced (refresh find_node
    /// queries).
    pub fn tick(&mut self) -> Vec<(SocketAddr, OutboundMessage)> {
        self.secrets.maybe_rotate();
        self.announce_store.prune_expired();
        let mut timed_out_queries = Vec::new();
        for entry in self.searches.values_mut() {
            timed_out_queries.extend(entry.search.tick());
            // A converged search with nothing left to announce (a plain
            // find_node, or a get_peers with no announce port) otherwise
            // sits at `Converged` forever; `finish` is a no-op in every
            // other state, so this is safe to call unconditionally.
            entry.search.finish();
        }
        // A search's shortlist is scoped to the search; `failed_queries`
        // on a routing-table entry is not, so a query timeout needs to be
        // fed back into whichever table (if any) already knows this node.
        for (id, addr) in timed_out_queries {
            if let Some(table) = self.table_for_addr(addr) {
                table.touch_query_timeout(&id);
            }
        }
        self.reap_timed_out_eviction_pings();
        self.refresh_stale_buckets();
        self.reap_finished_searches();
        self.drain_outbound_queries()
    }

    /// An eviction probe that never got a `ping_reply` within the query
    /// timeout counts as a failed ping: the stale incumbent is evicted
    /// in favor of the newcomer that triggered the probe.
    fn reap_timed_out_eviction_pings(&mut self) {
        let timeout = Duration::from_secs(QUERY_TIMEOUT_SECS);
        let now = Instant::now();
        let timed_out: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter_map(|(tid, route)| match route {
                PendingRoute::EvictionPing { sent_at, .. } if now.duration_since(*sent_at) > timeout => {
                    Some(tid.clone())
                }
                _ => None,
            })
            .collect();
        for tid in timed_out {
            if let Some(PendingRoute::EvictionPing { family, stale_id, new_node, .. }) =
                self.pending.remove(&tid)
            {
                if let Some(table) = self.table_for_family(family) {
                    table.evict_and_insert(&stale_id, new_node);
                }
            }
        }
    }

    fn refresh_stale_buckets(&mut self) {
        for family in [SocketFamily::V4, SocketFamily::V6] {
            let Some(table) = self.table_for_family(family) else { continue };
            let stale = table.stale_bucket_indices();
            for idx in stale {
                let target = table.refresh_target(idx);
                table.mark_bucket_refreshed(idx);
                self.start_search(target, SearchKind::FindNode, None, Vec::new(), None);
            }
        }
    }

    /// Dispatches one inbound, decoded KRPC message.
    pub fn handle_inbound(&mut self, from: SocketAddr, msg: InboundMessage) -> DispatchOutput {
        let mut output = DispatchOutput::default();
        match msg {
            InboundMessage::Ping { tid, sender } => {
                output.outbound.extend(self.record_contact(sender, from, ContactEvent::QueryRcv));
                output.outbound.push((from, OutboundMessage::PingReply { tid }));
            }
            InboundMessage::FindNode { tid, sender, target, want_v6 } => {
                output.outbound.extend(self.record_contact(sender, from, ContactEvent::QueryRcv));
                let nodes = self
                    .table_v4
                    .as_ref()
                    .map(|t| t.closest_nodes(&target, K).into_iter().map(record_to_compact).collect())
                    .unwrap_or_default();
                let nodes6 = if want_v6 {
                    self.table_v6
                        .as_ref()
                        .map(|t| t.closest_nodes(&target, K).into_iter().map(record_to_compact).collect())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                output
                    .outbound
                    .push((from, OutboundMessage::FindNodeReply { tid, nodes, nodes6 }));
            }
            InboundMessage::GetPeers { tid, sender, infohash, want_v6 } => {
                output.outbound.extend(self.record_contact(sender, from, ContactEvent::QueryRcv));
                let token = self.secrets.mint(from.ip(), from.port());
                if self.announce_store.has_peers(&infohash) {
                    let values = self
                        .announce_store
                        .get(&infohash)
                        .into_iter()
                        .map(|(ip, port)| SocketAddr::new(ip, port))
                        .collect();
                    output.outbound.push((
                        from,
                        OutboundMessage::GetPeersReply {
                            tid,
                            token,
                            nodes: Vec::new(),
                            nodes6: Vec::new(),
                            values,
                        },
                    ));
                } else {
                    let nodes = self
                        .table_v4
                        .as_ref()
                        .map(|t| t.closest_nodes(&infohash, K).into_iter().map(record_to_compact).collect())
                        .unwrap_or_default();
                    let nodes6 = if want_v6 {
                        self.table_v6
                            .as_ref()
                            .map(|t| t.closest_nodes(&infohash, K).into_iter().map(record_to_compact).collect())
                            .unwrap_or_default()
                    } else {
                        Vec::new()
                    };
                    output.outbound.push((
                        from,
                        OutboundMessage::GetPeersReply { tid, token, nodes, nodes6, values: Vec::new() },
                    ));
                }
            }
            InboundMessage::AnnouncePeer { tid, sender, infohash, port, implied_port, token } => {
                output.outbound.extend(self.record_contact(sender, from, ContactEvent::QueryRcv));
                if self.secrets.is_valid(&token, from.ip(), from.port()) {
                    let announce_port = if implied_port { from.port() } else { port };
                    self.announce_store.put(infohash, from.ip(), announce_port);
                    output.outbound.push((from, OutboundMessage::PingReply { tid }));
                } else {
                    warn!(%from, "announce_peer with wrong token");
                    output.outbound.push((
                        from,
                        OutboundMessage::Error {
                            tid,
                            code: 203,
                            message: "Announce_peer with wrong token".to_string(),
                        },
                    ));
                }
            }
            InboundMessage::PingReply { tid, sender } => {
                output.outbound.extend(self.record_contact(sender, from, ContactEvent::ResponseRcv));
                self.route_eviction_ping(&tid, sender, true);
            }
            InboundMessage::FindNodeReply { tid, sender, nodes, nodes6 } => {
                output.outbound.extend(self.record_contact(sender, from, ContactEvent::ResponseRcv));
                let mut combined = nodes;
                combined.extend(nodes6);
                // A find_node_reply routed to a get_peers search is
                // reinterpreted as a token-less get_peers_reply.
                self.route_search_response(&tid, from, sender, None, combined, Vec::new(), &mut output);
            }
            InboundMessage::GetPeersReply { tid, sender, token, nodes, nodes6, values } => {
                output.outbound.extend(self.record_contact(sender, from, ContactEvent::ResponseRcv));
                let mut combined = nodes;
                combined.extend(nodes6);
                self.route_search_response(&tid, from, sender, token, combined, values, &mut output);
            }
            InboundMessage::ErrorReply { code, message, .. } => {
                warn!(code, %message, %from, "KRPC error_reply");
            }
            InboundMessage::Invalid { reason } => {
                debug!(%from, %reason, "dropping malformed/unknown datagram");
            }
        }
        output
    }

    fn route_eviction_ping(&mut self, tid: &TransactionId, _sender: NodeId, succeeded: bool) {
        match self.pending.remove(&tid.0) {
            Some(PendingRoute::EvictionPing { family, stale_id, new_node, .. }) => {
                if !succeeded {
                    if let Some(table) = self.table_for_family(family) {
                        table.evict_and_insert(&stale_id, new_node);
                    }
                }
                // On success the candidate already had its liveness touched
                // by `record_contact` above; the newcomer is simply dropped.
            }
            Some(PendingRoute::AnnounceFired) | None => {}
            Some(other) => {
                // A ping_reply landed on a tid owned by a running search;
                // put it back so route_search_response can still claim it.
                self.pending.insert(tid.0.clone(), other);
            }
        }
    }

    fn route_search_response(
        &mut self,
        tid: &TransactionId,
        from: SocketAddr,
        sender: NodeId,
        token: Option<crate::token::Token>,
        nodes: Vec<CompactNode>,
        values: Vec<SocketAddr>,
        output: &mut DispatchOutput,
    ) {
        match self.pending.remove(&tid.0) {
            Some(PendingRoute::SearchQuery { search_id }) => {
                let Some(entry) = self.searches.get_mut(&search_id) else {
                    return;
                };
                let fresh = entry.search.handle_response(from, sender, token, nodes, values);
                if let Some(cb) = entry.callback.as_mut() {
                    for addr in &fresh {
                        cb(*addr);
                    }
                }
                output.delivered_peers.extend(fresh);
            }
            Some(PendingRoute::AnnounceFired) | None => {
                debug!(?tid, "reply with unknown or fire-and-forget transaction id dropped");
            }
            Some(other) => {
                self.pending.insert(tid.0.clone(), other);
            }
        }
    }

    /// Touches (or creates) the sender's routing-table entry. If the
    /// bucket was full and not splittable, returns the ping the server
    /// loop must send to the most-questionable incumbent before
    /// deciding whether to evict it in favor of the newcomer.
    fn record_contact(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
        event: ContactEvent,
    ) -> Option<(SocketAddr, OutboundMessage)> {
        let family = family_of(addr);
        let known = self.table_for_family(family).map(|t| t.get(&id).is_some()).unwrap_or(false);
        if known {
            if let Some(table) = self.table_for_family(family) {
                match event {
                    ContactEvent::QueryRcv => table.touch_query_rcv(&id),
                    ContactEvent::ResponseRcv => table.touch_response_rcv(&id),
                }
            }
            return None;
        }
        let mut record = NodeRecord::new(id, addr.ip(), addr.port(), family);
        match event {
            ContactEvent::QueryRcv => record.touch_query_rcv(Instant::now()),
            ContactEvent::ResponseRcv => record.touch_response_rcv(Instant::now()),
        }
        let table = self.table_for_family(family)?;
        if let AddOutcome::NeedsPing { candidate_id, new_node } = table.add(record) {
            let candidate_addr = table.get(&candidate_id).map(|n| n.addr())?;
            let tid = self.alloc_tid();
            self.pending.insert(
                tid.0.clone(),
                PendingRoute::EvictionPing { family, stale_id: candidate_id, new_node, sent_at: Instant::now() },
            );
            return Some((candidate_addr, OutboundMessage::Ping { tid }));
        }
        None
    }
}

enum ContactEvent {
    QueryRcv,
    ResponseRcv,
}

fn family_of(addr: SocketAddr) -> SocketFamily {
    match addr.ip() {
        IpAddr::V4(_) => SocketFamily::V4,
        IpAddr::V6(_) => SocketFamily::V6,
    }
}

fn record_to_compact(record: NodeRecord) -> CompactNode {
    CompactNode { id: record.id, addr: record.addr() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DhtConfig {
        DhtConfig { ipv4: true, ipv6: false, port: 6881, bootstrap_nodes: Vec::new() }
    }

    #[test]
    fn ping_query_is_answered() {
        let mut server = Server::new(&config(), NodeId::random()).expect("valid config");
        let from: SocketAddr = "1.2.3.4:6881".parse().expect("valid addr");
        let output = server.handle_inbound(
            from,
            InboundMessage::Ping { tid: TransactionId(vec![1, 2]), sender: NodeId::random() },
        );
        assert_eq!(output.outbound.len(), 1);
        assert!(matches!(output.outbound[0].1, OutboundMessage::PingReply { .. }));
    }

    #[test]
    fn config_without_any_family_fails_construction() {
        let bad = DhtConfig { ipv4: false, ipv6: false, ..config() };
        assert!(matches!(Server::new(&bad, NodeId::random()), Err(DhtError::NoAddressFamily)));
    }

    #[test]
    fn announce_with_wrong_token_is_rejected() {
        let mut server = Server::new(&config(), NodeId::random()).expect("valid config");
        let from: SocketAddr = "1.2.3.4:6881".parse().expect("valid addr");
        let bad_token = crate::token::Token([0u8; 20]);
        let output = server.handle_inbound(
            from,
            InboundMessage::AnnouncePeer {
                tid: TransactionId(vec![1]),
                sender: NodeId::random(),
                infohash: NodeId::random(),
                port: 6881,
                implied_port: false,
                token: bad_token,
            },
        );
        assert!(matches!(
            output.outbound[0].1,
            OutboundMessage::Error { code: 203, .. }
        ));
    }

    #[test]
    fn get_peers_without_announce_returns_closest_nodes() {
        let mut server = Server::new(&config(), NodeId::random()).expect("valid config");
        let from: SocketAddr = "1.2.3.4:6881".parse().expect("valid addr");
        let output = server.handle_inbound(
            from,
            InboundMessage::GetPeers {
                tid: TransactionId(vec![1]),
                sender: NodeId::random(),
                infohash: NodeId::random(),
                want_v6: false,
            },
        );
        match &output.outbound[0].1 {
            OutboundMessage::GetPeersReply { values, .. } => assert!(values.is_empty()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    /// Filling the only bucket on a branch that can't split (because the
    /// branch doesn't cover the local id) must trigger an eviction ping
    /// for the 9th arrival, rather than silently dropping it.
    #[test]
    fn full_unsplittable_bucket_triggers_eviction_ping() {
        let local = NodeId::ZERO;
        let mut server = Server::new(&config(), local).expect("valid config");
        for i in 0..K {
            let id = local.flip_bit(0).flip_bit(100 + i);
            let addr: SocketAddr = format!("10.0.0.{}:6881", i + 1).parse().expect("valid addr");
            let output = server.handle_inbound(addr, InboundMessage::Ping { tid: TransactionId(vec![i as u8]), sender: id });
            assert_eq!(output.outbound.len(), 1, "no eviction ping expected while filling");
        }
        let ninth = local.flip_bit(0).flip_bit(150);
        let addr: SocketAddr = "10.0.0.9:6881".parse().expect("valid addr");
        let output = server.handle_inbound(addr, InboundMessage::Ping { tid: TransactionId(vec![9]), sender: ninth });
        assert_eq!(output.outbound.len(), 2, "expected an eviction ping plus the ping_reply");
        assert!(matches!(output.outbound[0].1, OutboundMessage::Ping { .. }));
        assert!(matches!(output.outbound[1].1, OutboundMessage::PingReply { .. }));
    }

    /// An eviction ping that never gets a reply times out and evicts the
    /// stale incumbent in favor of the newcomer that triggered it.
    #[test]
    fn eviction_ping_timeout_evicts_stale_incumbent() {
        let local = NodeId::ZERO;
        let mut server = Server::new(&config(), local).expect("valid config");
        for i in 0..K {
            let id = local.flip_bit(0).flip_bit(100 + i);
            let addr: SocketAddr = format!("10.0.0.{}:6881", i + 1).parse().expect("valid addr");
            server.handle_inbound(addr, InboundMessage::Ping { tid: TransactionId(vec![i as u8]), sender: id });
        }
        let ninth = local.flip_bit(0).flip_bit(150);
        let addr: SocketAddr = "10.0.0.9:6881".parse().expect("valid addr");
        server.handle_inbound(addr, InboundMessage::Ping { tid: TransactionId(vec![9]), sender: ninth });
        assert!(server.pending.values().any(|r| matches!(r, PendingRoute::EvictionPing { .. })));

        // Force the probe's `sent_at` into the past instead of sleeping.
        for route in server.pending.values_mut() {
            if let PendingRoute::EvictionPing { sent_at, .. } = route {
                *sent_at = Instant::now() - Duration::from_secs(QUERY_TIMEOUT_SECS + 1);
            }
        }
        server.reap_timed_out_eviction_pings();

        assert!(!server.pending.values().any(|r| matches!(r, PendingRoute::EvictionPing { .. })));
        let table = server.table_v4.as_ref().expect("ipv4 table");
        assert!(table.get(&ninth).is_some(), "newcomer should have been inserted");
    }

    /// A plain `find_node` search that converges with no further
    /// candidates to announce to must still be reaped by `tick`,
    /// rather than sitting at `Converged` forever.
    #[test]
    fn converged_find_node_search_is_reaped_on_tick() {
        let mut server = Server::new(&config(), NodeId::random()).expect("valid config");
        let seed_addr: SocketAddr = "10.0.0.1:6881".parse().expect("valid addr");
        let seed_id = NodeId::random();
        let seed = CompactNode { id: seed_id, addr: seed_addr };
        let search_id =
            server.start_search(NodeId::random(), SearchKind::FindNode, None, vec![seed], None);

        let queries = server.drain_outbound_queries();
        assert_eq!(queries.len(), 1);
        let OutboundMessage::FindNode { tid, .. } = &queries[0].1 else {
            panic!("expected a find_node query");
        };

        let mut output = DispatchOutput::default();
        server.route_search_response(tid, seed_addr, seed_id, None, Vec::new(), Vec::new(), &mut output);
        assert_eq!(server.search_state(search_id), Some(SearchState::Converged));

        server.tick();
        assert_eq!(server.search_state(search_id), None, "converged search should have been reaped");
    }

    /// Outbound search queries must carry the search's own target, not
    /// the local node's id — a remote node resolves `find_node`/
    /// `get_peers` against whatever key is on the wire.
    #[test]
    fn outbound_queries_carry_the_search_target_not_local_id() {
        let local = NodeId::ZERO;
        let mut server = Server::new(&config(), local).expect("valid config");
        let seed_addr: SocketAddr = "10.0.0.1:6881".parse().expect("valid addr");
        let seed = CompactNode { id: NodeId::random(), addr: seed_addr };
        let target = NodeId::random();
        assert_ne!(target, local);

        server.start_search(target, SearchKind::FindNode, None, vec![seed.clone()], None);
        let queries = server.drain_outbound_queries();
        assert_eq!(queries.len(), 1);
        let OutboundMessage::FindNode { target: wire_target, .. } = &queries[0].1 else {
            panic!("expected a find_node query");
        };
        assert_eq!(*wire_target, target);

        let mut server = Server::new(&config(), local).expect("valid config");
        server.start_search(target, SearchKind::GetPeers, None, vec![seed], None);
        let queries = server.drain_outbound_queries();
        assert_eq!(queries.len(), 1);
        let OutboundMessage::GetPeers { infohash, .. } = &queries[0].1 else {
            panic!("expected a get_peers query");
        };
        assert_eq!(*infohash, target);
    }

    /// A search query that times out against a node already sitting in
    /// the routing table must bump that node's `failed_queries`, not
    /// just the search's own internal shortlist bookkeeping.
    #[test]
    fn search_query_timeout_bumps_routing_table_failed_queries() {
        let local = NodeId::ZERO;
        let mut server = Server::new(&config(), local).expect("valid config");
        let peer_addr: SocketAddr = "10.0.0.1:6881".parse().expect("valid addr");
        let peer_id = NodeId::random();
        server.handle_inbound(
            peer_addr,
            InboundMessage::Ping { tid: TransactionId(vec![0]), sender: peer_id },
        );
        assert!(server.table_v4.as_ref().expect("ipv4 table").get(&peer_id).is_some());

        let seed = CompactNode { id: peer_id, addr: peer_addr };
        server.start_search(NodeId::random(), SearchKind::FindNode, None, vec![seed], None);
        let queries = server.drain_outbound_queries();
        assert_eq!(queries.len(), 1);

        for entry in server.searches.values_mut() {
            entry.search.force_timeouts();
        }

        server.tick();
        let record = server.table_v4.as_ref().expect("ipv4 table").get(&peer_id).expect("still present");
        assert_eq!(record.failed_queries, 1);
    }

    #[test]
    fn start_bootstrap_seeds_a_find_node_search() {
        let mut server = Server::new(&config(), NodeId::random()).expect("valid config");
        let seeds = BootstrapSeeds { resolved: vec!["10.0.0.1:6881".parse().expect("valid addr")] };
        let id = server.start_bootstrap(&seeds).expect("seeds resolved");
        assert_eq!(server.search_state(id), Some(SearchState::Init));
        assert_eq!(server.drain_outbound_queries().len(), 1);
    }

    #[test]
    fn start_bootstrap_with_no_seeds_starts_nothing() {
        let mut server = Server::new(&config(), NodeId::random()).expect("valid config");
        let seeds = BootstrapSeeds { resolved: Vec::new() };
        assert!(server.start_bootstrap(&seeds).is_none());
        assert!(server.searches.is_empty());
    }
}
