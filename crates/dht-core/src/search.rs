//! The iterative α-parallel search engine: one state machine per
//! `find_node` or `get_peers` lookup.
//!
//! A [`Search`] never touches a socket. The server loop calls
//! [`Search::next_queries`] to learn what to send, and feeds responses
//! back via [`Search::handle_response`] / [`Search::handle_timeout`].
//! Transaction-id bookkeeping (matching a reply to the search that owns
//! it) lives in [`crate::server`], not here.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::id::NodeId;
use crate::token::Token;
use crate::wire::CompactNode;
use crate::{ALPHA, K, QUERY_TIMEOUT_SECS, SEARCH_BUDGET_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    FindNode,
    GetPeers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Init,
    Running,
    Converged,
    Announce,
    Done,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateStatus {
    Unqueried,
    Pending,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: NodeId,
    addr: SocketAddr,
    status: CandidateStatus,
    token: Option<Token>,
    sent_at: Option<Instant>,
}

/// What the server loop should send for a query the search just issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    FindNode,
    GetPeers,
}

pub struct Search {
    pub target: NodeId,
    pub kind: SearchKind,
    pub announce_port: Option<u16>,
    shortlist: Vec<Candidate>,
    state: SearchState,
    started_at: Instant,
    seen_peers: std::collections::HashSet<SocketAddr>,
}

impl Search {
    pub fn new(target: NodeId, kind: SearchKind, start_nodes: Vec<CompactNode>, announce_port: Option<u16>) -> Self {
        let mut shortlist: Vec<Candidate> = start_nodes
            .into_iter()
            .map(|n| Candidate {
                id: n.id,
                addr: n.addr,
                status: CandidateStatus::Unqueried,
                token: None,
                sent_at: None,
            })
            .collect();
        shortlist.sort_by_key(|c| c.id.distance(&target));
        shortlist.truncate(K);
        Search {
            target,
            kind,
            announce_port,
            shortlist,
            state: SearchState::Init,
            started_at: Instant::now(),
            seen_peers: std::collections::HashSet::new(),
        }
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    /// Back-dates every `Pending` candidate's `sent_at` so the next
    /// `tick()` treats it as timed out, without sleeping in tests.
    #[cfg(test)]
    pub(crate) fn force_timeouts(&mut self) {
        let past = Instant::now() - Duration::from_secs(QUERY_TIMEOUT_SECS + 1);
        for c in self.shortlist.iter_mut() {
            if c.status == CandidateStatus::Pending {
                c.sent_at = Some(past);
            }
        }
    }

    fn query_kind(&self) -> QueryKind {
        match self.kind {
            SearchKind::FindNode => QueryKind::FindNode,
            SearchKind::GetPeers => QueryKind::GetPeers,
        }
    }

    fn pending_count(&self) -> usize {
        self.shortlist
            .iter()
            .filter(|c| c.status == CandidateStatus::Pending)
            .count()
    }

    fn kth_best_responded_distance(&self) -> Option<crate::id::Distance> {
        let mut responded: Vec<_> = self
            .shortlist
            .iter()
            .filter(|c| c.status == CandidateStatus::Responded)
            .map(|c| c.id.distance(&self.target))
            .collect();
        if responded.len() < K {
            return None;
        }
        responded.sort();
        responded.into_iter().nth(K - 1)
    }

    /// Up to `ALPHA - pending` new queries to send right now. Moves the
    /// chosen candidates to `Pending` and stamps `sent_at`.
    pub fn next_queries(&mut self) -> Vec<(NodeId, SocketAddr, QueryKind)> {
        if matches!(
            self.state,
            SearchState::Done | SearchState::Cancelled | SearchState::TimedOut
        ) {
            return Vec::new();
        }
        if self.state == SearchState::Init {
            self.state = SearchState::Running;
        }
        if self.state != SearchState::Running {
            return Vec::new();
        }

        let kth = self.kth_best_responded_distance();
        let mut out = Vec::new();
        let now = Instant::now();
        loop {
            if self.pending_count() >= ALPHA {
                break;
            }
            let next_idx = self
                .shortlist
                .iter()
                .enumerate()
                .filter(|(_, c)| c.status == CandidateStatus::Unqueried)
                .filter(|(_, c)| match kth {
                    None => true,
                    Some(kth) => c.id.distance(&self.target) < kth,
                })
                .min_by_key(|(_, c)| c.id.distance(&self.target))
                .map(|(i, _)| i);
            let Some(idx) = next_idx else { break };
            self.shortlist[idx].status = CandidateStatus::Pending;
            self.shortlist[idx].sent_at = Some(now);
            out.push((self.shortlist[idx].id, self.shortlist[idx].addr, self.query_kind()));
        }
        out
    }

    /// Feed a response back in, keyed by the address the query was sent
    /// to (not by id: a bootstrap or refresh candidate's real id is
    /// only known once it replies, so several in-flight candidates may
    /// still share the `NodeId::ZERO` placeholder). `sender_id` is the
    /// id the reply itself claims, which updates the candidate's
    /// record. Returns newly discovered peer addresses (deduplicated
    /// per search) that the caller should forward to the user's
    /// `get_peers` callback.
    pub fn handle_response(
        &mut self,
        from_addr: SocketAddr,
        sender_id: NodeId,
        token: Option<Token>,
        nodes: Vec<CompactNode>,
        values: Vec<SocketAddr>,
    ) -> Vec<SocketAddr> {
        if let Some(c) = self.shortlist.iter_mut().find(|c| c.addr == from_addr) {
            c.id = sender_id;
            c.status = CandidateStatus::Responded;
            c.token = token;
        }
        self.merge_candidates(nodes);

        let mut fresh = Vec::new();
        for addr in values {
            if self.seen_peers.insert(addr) {
                fresh.push(addr);
            }
        }
        self.recompute_state();
        fresh
    }

    pub fn handle_timeout(&mut self, from_addr: SocketAddr) {
        if let Some(c) = self.shortlist.iter_mut().find(|c| c.addr == from_addr) {
            c.status = CandidateStatus::Failed;
        }
        self.recompute_state();
    }

    /// Sweeps candidates whose query has been pending longer than
    /// [`QUERY_TIMEOUT_SECS`] without a reply, and enforces the overall
    /// search budget. Should be called periodically by the glue layer.
    ///
    /// Returns the candidates that just timed out this call, so the
    /// caller can feed the failure back into the routing table's
    /// liveness tracking for any of them that are known nodes — a
    /// search's shortlist is scoped to the search, but `failed_queries`
    /// on a long-lived `NodeRecord` is not.
    pub fn tick(&mut self) -> Vec<(NodeId, SocketAddr)> {
        let now = Instant::now();
        let timeout = Duration::from_secs(QUERY_TIMEOUT_SECS);
        let mut timed_out = Vec::new();
        for c in self.shortlist.iter_mut() {
            if c.status == CandidateStatus::Pending {
                if let Some(sent_at) = c.sent_at {
                    if now.duration_since(sent_at) >= timeout {
                        c.status = CandidateStatus::Failed;
                        timed_out.push((c.id, c.addr));
                    }
                }
            }
        }
        if now.duration_since(self.started_at) >= Duration::from_secs(SEARCH_BUDGET_SECS)
            && !matches!(self.state, SearchState::Done | SearchState::Cancelled)
        {
            self.state = SearchState::TimedOut;
            return timed_out;
        }
        self.recompute_state();
        timed_out
    }

    fn merge_candidates(&mut self, nodes: Vec<CompactNode>) {
        for node in nodes {
            if self.shortlist.iter().any(|c| c.id == node.id) {
                continue;
            }
            self.shortlist.push(Candidate {
                id: node.id,
                addr: node.addr,
                status: CandidateStatus::Unqueried,
                token: None,
                sent_at: None,
            });
        }
        let target = self.target;
        self.shortlist.sort_by_key(|c| c.id.distance(&target));
        self.shortlist.truncate(K);
    }

    fn recompute_state(&mut self) {
        if matches!(
            self.state,
            SearchState::Done | SearchState::Cancelled | SearchState::TimedOut
        ) {
            return;
        }
        let no_better_unqueried = match self.kth_best_responded_distance() {
            Some(kth) => !self
                .shortlist
                .iter()
                .any(|c| c.status == CandidateStatus::Unqueried && c.id.distance(&self.target) < kth),
            None => !self.shortlist.iter().any(|c| c.status == CandidateStatus::Unqueried),
        };
        if no_better_unqueried && self.pending_count() == 0 {
            self.state = SearchState::Converged;
            if self.kind == SearchKind::GetPeers && self.announce_port.is_some() {
                self.state = SearchState::Announce;
            }
        }
    }

    /// Valid only in [`SearchState::Announce`]. Returns the up-to-K
    /// closest responded nodes that returned a token, and transitions
    /// the search to `Done`.
    pub fn take_announce_targets(&mut self) -> Vec<(NodeId, SocketAddr, Token)> {
        if self.state != SearchState::Announce {
            return Vec::new();
        }
        let targets = self
            .shortlist
            .iter()
            .filter(|c| c.status == CandidateStatus::Responded)
            .filter_map(|c| c.token.map(|t| (c.id, c.addr, t)))
            .take(K)
            .collect();
        self.state = SearchState::Done;
        targets
    }

    /// For a plain (non-announcing) search, call once `Converged` to
    /// move it to its terminal state.
    pub fn finish(&mut self) {
        if self.state == SearchState::Converged {
            self.state = SearchState::Done;
        }
    }

    pub fn cancel(&mut self) {
        self.state = SearchState::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(byte: u8, port: u16) -> CompactNode {
        let mut bytes = [0u8; 20];
        bytes[19] = byte;
        CompactNode {
            id: NodeId::from_bytes(bytes),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port),
        }
    }

    #[test]
    fn new_search_starts_at_init() {
        let search = Search::new(NodeId::random(), SearchKind::FindNode, vec![node(1, 6001)], None);
        assert_eq!(search.state(), SearchState::Init);
    }

    #[test]
    fn next_queries_respects_alpha() {
        let seeds = (1..=10).map(|i| node(i, 6000 + i as u16)).collect();
        let mut search = Search::new(NodeId::random(), SearchKind::FindNode, seeds, None);
        let queries = search.next_queries();
        assert_eq!(queries.len(), ALPHA);
        assert_eq!(search.state(), SearchState::Running);
    }

    #[test]
    fn search_converges_when_no_better_candidate_remains() {
        let seed = node(1, 6001);
        let (seed_id, seed_addr) = (seed.id, seed.addr);
        let mut search = Search::new(NodeId::random(), SearchKind::FindNode, vec![seed], None);
        let queries = search.next_queries();
        assert_eq!(queries.len(), 1);
        search.handle_response(seed_addr, seed_id, None, Vec::new(), Vec::new());
        assert_eq!(search.state(), SearchState::Converged);
    }

    #[test]
    fn get_peers_with_announce_transitions_to_announce_then_done() {
        let seed = node(1, 6001);
        let (seed_id, seed_addr) = (seed.id, seed.addr);
        let mut search = Search::new(NodeId::random(), SearchKind::GetPeers, vec![seed], Some(6881));
        search.next_queries();
        let token = Token([7u8; 20]);
        search.handle_response(seed_addr, seed_id, Some(token), Vec::new(), Vec::new());
        assert_eq!(search.state(), SearchState::Announce);
        let targets = search.take_announce_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, seed_id);
        assert_eq!(search.state(), SearchState::Done);
    }

    #[test]
    fn get_peers_values_are_deduplicated() {
        let seed = node(1, 6001);
        let (seed_id, seed_addr) = (seed.id, seed.addr);
        let mut search = Search::new(NodeId::random(), SearchKind::GetPeers, vec![seed], None);
        search.next_queries();
        let peer: SocketAddr = "9.9.9.9:4000".parse().expect("valid addr");
        let fresh1 = search.handle_response(seed_addr, seed_id, None, Vec::new(), vec![peer]);
        assert_eq!(fresh1, vec![peer]);
        // A second response (e.g. a duplicate from another path) with the
        // same peer should not be reported again.
        let fresh2 = search.handle_response(seed_addr, seed_id, None, Vec::new(), vec![peer]);
        assert!(fresh2.is_empty());
    }

    #[test]
    fn timeout_marks_candidate_failed_and_does_not_retry() {
        let seed = node(1, 6001);
        let seed_addr = seed.addr;
        let mut search = Search::new(NodeId::random(), SearchKind::FindNode, vec![seed], None);
        search.next_queries();
        search.handle_timeout(seed_addr);
        // No more unqueried candidates remain, so no further queries are
        // issued for this node even though it never responded.
        assert!(search.next_queries().is_empty());
    }

    #[test]
    fn cancel_is_terminal() {
        let mut search = Search::new(NodeId::random(), SearchKind::FindNode, vec![node(1, 6001)], None);
        search.cancel();
        assert_eq!(search.state(), SearchState::Cancelled);
        assert!(search.next_queries().is_empty());
    }
}
