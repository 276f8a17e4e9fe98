//! Per-peer state and liveness classification.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::id::NodeId;
use crate::{BAD_FAILED_QUERIES, GOOD_WINDOW_SECS};

/// Which address family a [`NodeRecord`] was seen on. The two families
/// are tracked in independent routing tables, but the type lives here
/// since it's a property of the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    V4,
    V6,
}

/// Liveness class of a known peer, per Kademlia / BEP 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Good,
    Questionable,
    Bad,
}

/// Per-peer state tracked by the routing table.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
    pub socket_family: SocketFamily,
    pub last_query_rcv: Option<Instant>,
    pub last_response_rcv: Option<Instant>,
    pub last_query_sent: Option<Instant>,
    pub failed_queries: u32,
    /// Set once this node has ever sent us a valid response.
    pub ever_responded: bool,
}

impl NodeRecord {
    pub fn new(id: NodeId, ip: IpAddr, port: u16, socket_family: SocketFamily) -> Self {
        NodeRecord {
            id,
            ip,
            port,
            socket_family,
            last_query_rcv: None,
            last_response_rcv: None,
            last_query_sent: None,
            failed_queries: 0,
            ever_responded: false,
        }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }

    /// Status derivation:
    /// - good: responded or queried us within the last 15 minutes, OR has
    ///   ever responded AND queried us within the last 15 minutes.
    /// - bad: `failed_queries >= 5`.
    /// - else questionable.
    pub fn status(&self, now: Instant) -> Status {
        if self.failed_queries >= BAD_FAILED_QUERIES {
            return Status::Bad;
        }
        let window = Duration::from_secs(GOOD_WINDOW_SECS);
        let recent = |t: Option<Instant>| t.is_some_and(|t| now.duration_since(t) < window);
        if recent(self.last_response_rcv) || recent(self.last_query_rcv) {
            return Status::Good;
        }
        if self.ever_responded && recent(self.last_query_rcv) {
            return Status::Good;
        }
        Status::Questionable
    }

    pub fn touch_query_rcv(&mut self, now: Instant) {
        self.last_query_rcv = Some(now);
    }

    pub fn touch_response_rcv(&mut self, now: Instant) {
        self.last_response_rcv = Some(now);
        self.ever_responded = true;
        self.failed_queries = 0;
    }

    pub fn touch_query_sent(&mut self, now: Instant) {
        self.last_query_sent = Some(now);
    }

    pub fn touch_query_timeout(&mut self) {
        self.failed_queries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn record() -> NodeRecord {
        NodeRecord::new(
            NodeId::random(),
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            6881,
            SocketFamily::V4,
        )
    }

    #[test]
    fn fresh_node_is_questionable() {
        let n = record();
        assert_eq!(n.status(Instant::now()), Status::Questionable);
    }

    #[test]
    fn node_with_recent_response_is_good() {
        let mut n = record();
        n.touch_response_rcv(Instant::now());
        assert_eq!(n.status(Instant::now()), Status::Good);
    }

    #[test]
    fn node_with_five_failures_is_bad() {
        let mut n = record();
        for _ in 0..5 {
            n.touch_query_timeout();
        }
        assert_eq!(n.status(Instant::now()), Status::Bad);
    }

    #[test]
    fn response_resets_failed_queries() {
        let mut n = record();
        n.touch_query_timeout();
        n.touch_query_timeout();
        n.touch_response_rcv(Instant::now());
        assert_eq!(n.failed_queries, 0);
    }

    #[test]
    fn ever_responded_plus_recent_query_is_good() {
        let mut n = record();
        n.touch_response_rcv(Instant::now() - Duration::from_secs(GOOD_WINDOW_SECS + 60));
        n.touch_query_rcv(Instant::now());
        assert_eq!(n.status(Instant::now()), Status::Good);
    }
}
