//! The Kademlia routing table: a binary tree of buckets over the XOR
//! metric, splitting only along the branch that contains the local
//! node ID.
//!
//! A single [`RoutingTable`] is scoped to one address family; the
//! caller (the server loop) holds two independent tables for IPv4 and
//! IPv6.

use std::time::{Duration, Instant};

use crate::id::NodeId;
use crate::node::{NodeRecord, Status};
use crate::{BUCKET_STALE_SECS, K};

/// An ordered collection of at most `K` node records.
#[derive(Debug)]
pub struct Bucket {
    nodes: Vec<NodeRecord>,
    last_changed: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Bucket {
            nodes: Vec::with_capacity(K),
            last_changed: now,
        }
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_changed) > Duration::from_secs(BUCKET_STALE_SECS)
    }

    fn find(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    fn find_bad(&self, now: Instant) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.status(now) == Status::Bad)
    }

    /// The least-recently-seen entry: the natural ping-before-evict
    /// candidate for a full bucket with no bad nodes.
    fn least_recently_seen(&self) -> Option<&NodeRecord> {
        // `Option<Instant>` orders `None` before `Some`, so a node we've
        // never heard a response or query from sorts as the stalest.
        self.nodes
            .iter()
            .min_by_key(|n| n.last_response_rcv.or(n.last_query_rcv))
    }
}

/// Outcome of [`RoutingTable::add`].
#[derive(Debug)]
pub enum AddOutcome {
    /// New node inserted directly.
    Inserted,
    /// Existing node's liveness info refreshed.
    Updated,
    /// The local node's own id; never stored.
    Ignored,
    /// Bucket full, not splittable, and holds no bad node. The caller
    /// (server loop) must ping `candidate_id`; on failure, call
    /// [`RoutingTable::evict_and_insert`] with `new_node`; on success,
    /// drop `new_node`.
    NeedsPing {
        candidate_id: NodeId,
        new_node: NodeRecord,
    },
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        RoutingTable {
            local_id,
            buckets: vec![Bucket::new(Instant::now())],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the bucket that owns `id`. Every id except the local id
    /// maps to exactly one bucket; the last bucket covers every id
    /// sharing a prefix of at least `buckets.len() - 1` bits with the
    /// local id, i.e. the branch that still contains the local id and
    /// is the only one eligible to split further.
    fn bucket_index(&self, id: &NodeId) -> usize {
        let cpl = self.local_id.common_prefix_len(id);
        cpl.min(self.buckets.len() - 1)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        let idx = self.bucket_index(id);
        self.buckets[idx].find(id).map(|i| &self.buckets[idx].nodes[i])
    }

    /// Inserts or refreshes `record`. Never blocks: a full, non-splittable,
    /// all-good/questionable bucket defers to the caller via
    /// [`AddOutcome::NeedsPing`].
    pub fn add(&mut self, record: NodeRecord) -> AddOutcome {
        if record.id == self.local_id {
            return AddOutcome::Ignored;
        }
        let now = Instant::now();
        let idx = self.bucket_index(&record.id);

        if let Some(pos) = self.buckets[idx].find(&record.id) {
            self.buckets[idx].nodes[pos] = record;
            self.buckets[idx].last_changed = now;
            return AddOutcome::Updated;
        }

        if !self.buckets[idx].is_full() {
            self.buckets[idx].nodes.push(record);
            self.buckets[idx].last_changed = now;
            return AddOutcome::Inserted;
        }

        // Only the last bucket covers the local id's branch and may split.
        if idx == self.buckets.len() - 1 {
            self.split_last_bucket();
            return self.add(record);
        }

        if let Some(bad_pos) = self.buckets[idx].find_bad(now) {
            self.buckets[idx].nodes.remove(bad_pos);
            self.buckets[idx].nodes.push(record);
            self.buckets[idx].last_changed = now;
            return AddOutcome::Inserted;
        }

        let candidate_id = self.buckets[idx]
            .least_recently_seen()
            .expect("full bucket has at least one node")
            .id;
        AddOutcome::NeedsPing {
            candidate_id,
            new_node: record,
        }
    }

    /// Split the last (local-id-branch) bucket at its current depth,
    /// redistributing its nodes by the next bit of the local id. Nodes
    /// that diverged from local before this depth settle into a fixed
    /// sibling bucket; nodes that still share the deeper prefix stay on
    /// local's branch and remain eligible for further splits.
    fn split_last_bucket(&mut self) {
        let now = Instant::now();
        let old = self.buckets.pop().expect("table always has >=1 bucket");
        let new_depth = self.buckets.len() + 1;
        let mut diverged = Bucket::new(now);
        let mut local_branch = Bucket::new(now);
        for node in old.nodes {
            let cpl = self.local_id.common_prefix_len(&node.id);
            if cpl < new_depth {
                diverged.nodes.push(node);
            } else {
                local_branch.nodes.push(node);
            }
        }
        self.buckets.push(diverged);
        self.buckets.push(local_branch);
    }

    /// Called by the server loop after a ping to the
    /// [`AddOutcome::NeedsPing`] candidate has failed. Replaces it with
    /// `new_node`. If the candidate is no longer in the table (e.g. it
    /// responded and moved buckets via a split), this is a no-op.
    pub fn evict_and_insert(&mut self, stale_id: &NodeId, new_node: NodeRecord) {
        let idx = self.bucket_index(stale_id);
        if let Some(pos) = self.buckets[idx].find(stale_id) {
            self.buckets[idx].nodes.remove(pos);
            self.buckets[idx].nodes.push(new_node);
            self.buckets[idx].last_changed = Instant::now();
        }
    }

    pub fn touch_query_rcv(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        if let Some(pos) = self.buckets[idx].find(id) {
            self.buckets[idx].nodes[pos].touch_query_rcv(Instant::now());
            self.buckets[idx].last_changed = Instant::now();
        }
    }

    pub fn touch_response_rcv(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        if let Some(pos) = self.buckets[idx].find(id) {
            self.buckets[idx].nodes[pos].touch_response_rcv(Instant::now());
            self.buckets[idx].last_changed = Instant::now();
        }
    }

    pub fn touch_query_sent(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        if let Some(pos) = self.buckets[idx].find(id) {
            self.buckets[idx].nodes[pos].touch_query_sent(Instant::now());
        }
    }

    pub fn touch_query_timeout(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        if let Some(pos) = self.buckets[idx].find(id) {
            self.buckets[idx].nodes[pos].touch_query_timeout();
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<NodeRecord> {
        let idx = self.bucket_index(id);
        self.buckets[idx]
            .find(id)
            .map(|pos| self.buckets[idx].nodes.remove(pos))
    }

    /// Up to `n` records closest to `target`, sorted ascending by XOR
    /// distance, excluding `bad` nodes. Ties broken by: good over
    /// questionable, then lower `failed_queries`, then smaller id.
    pub fn closest_nodes(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        let now = Instant::now();
        let mut candidates: Vec<&NodeRecord> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.status(now) != Status::Bad)
            .collect();

        candidates.sort_by(|a, b| {
            let da = a.id.distance(target);
            let db = b.id.distance(target);
            da.cmp(&db)
                .then_with(|| {
                    let sa = a.status(now);
                    let sb = b.status(now);
                    rank(sa).cmp(&rank(sb))
                })
                .then_with(|| a.failed_queries.cmp(&b.failed_queries))
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates.into_iter().take(n).cloned().collect()
    }

    /// Bucket indices unchanged for longer than the stale window.
    pub fn stale_bucket_indices(&self) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_stale(now))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, idx: usize) {
        if let Some(b) = self.buckets.get_mut(idx) {
            b.last_changed = Instant::now();
        }
    }

    /// A random target within bucket `idx`'s range, for
    /// `refresh_stale_buckets`: the local id with bit `idx` flipped
    /// (and, for the last bucket, further bits randomized) always
    /// lands in that bucket's range.
    pub fn refresh_target(&self, idx: usize) -> NodeId {
        self.local_id.flip_bit(idx.min(crate::NODE_ID_BITS - 1))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

fn rank(s: Status) -> u8 {
    match s {
        Status::Good => 0,
        Status::Questionable => 1,
        Status::Bad => 2,
    }
}
