//! Message shapes and the codec/transport contracts that `dht-node`
//! implements. This module is deliberately bencode-agnostic: it only
//! models the decoded shape of a KRPC message.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::id::NodeId;
use crate::token::Token;

/// Opaque transaction id correlating a request with its reply.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TransactionId(pub Vec<u8>);

/// A node as it appears in compact node info: 26 bytes for IPv4 (20 id +
/// 4 ip + 2 port), 38 for IPv6 (20 + 16 + 2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl CompactNode {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(38);
        out.extend_from_slice(self.id.as_bytes());
        match self.addr.ip() {
            IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
        }
        out.extend_from_slice(&self.addr.port().to_be_bytes());
        out
    }

    pub fn decode_v4(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 26 {
            return None;
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes[0..20]);
        let ip = Ipv4Addr::new(bytes[20], bytes[21], bytes[22], bytes[23]);
        let port = u16::from_be_bytes([bytes[24], bytes[25]]);
        Some(CompactNode {
            id: NodeId::from_bytes(id),
            addr: SocketAddr::new(IpAddr::V4(ip), port),
        })
    }

    pub fn decode_v6(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 38 {
            return None;
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes[0..20]);
        let mut ip_bytes = [0u8; 16];
        ip_bytes.copy_from_slice(&bytes[20..36]);
        let ip = Ipv6Addr::from(ip_bytes);
        let port = u16::from_be_bytes([bytes[36], bytes[37]]);
        Some(CompactNode {
            id: NodeId::from_bytes(id),
            addr: SocketAddr::new(IpAddr::V6(ip), port),
        })
    }

    /// Parses a packed list of compact node info entries of a fixed
    /// per-entry size (26 for `nodes`, 38 for `nodes6`).
    pub fn decode_list(bytes: &[u8], v6: bool) -> Vec<CompactNode> {
        let entry_len = if v6 { 38 } else { 26 };
        bytes
            .chunks_exact(entry_len)
            .filter_map(|chunk| {
                if v6 {
                    CompactNode::decode_v6(chunk)
                } else {
                    CompactNode::decode_v4(chunk)
                }
            })
            .collect()
    }
}

/// Decoded shape of an inbound KRPC message, one variant per query/reply
/// kind plus an error reply and a catch-all for anything malformed.
#[derive(Clone, Debug)]
pub enum InboundMessage {
    Ping {
        tid: TransactionId,
        sender: NodeId,
    },
    FindNode {
        tid: TransactionId,
        sender: NodeId,
        target: NodeId,
        want_v6: bool,
    },
    GetPeers {
        tid: TransactionId,
        sender: NodeId,
        infohash: NodeId,
        want_v6: bool,
    },
    AnnouncePeer {
        tid: TransactionId,
        sender: NodeId,
        infohash: NodeId,
        port: u16,
        implied_port: bool,
        token: Token,
    },
    PingReply {
        tid: TransactionId,
        sender: NodeId,
    },
    FindNodeReply {
        tid: TransactionId,
        sender: NodeId,
        nodes: Vec<CompactNode>,
        nodes6: Vec<CompactNode>,
    },
    GetPeersReply {
        tid: TransactionId,
        sender: NodeId,
        token: Option<Token>,
        nodes: Vec<CompactNode>,
        nodes6: Vec<CompactNode>,
        values: Vec<SocketAddr>,
    },
    ErrorReply {
        tid: Option<TransactionId>,
        code: i64,
        message: String,
    },
    /// Decoded, but not a recognized query/reply shape, or recognized
    /// but structurally invalid (missing required fields). Dropped
    /// silently with a log line — never replied to, to avoid becoming
    /// an amplification vector.
    Invalid {
        reason: String,
    },
}

/// Shape the server loop hands to the transport for encoding.
#[derive(Clone, Debug)]
pub enum OutboundMessage {
    Ping {
        tid: TransactionId,
    },
    FindNode {
        tid: TransactionId,
        target: NodeId,
        want_v6: bool,
    },
    GetPeers {
        tid: TransactionId,
        infohash: NodeId,
        want_v6: bool,
    },
    AnnouncePeer {
        tid: TransactionId,
        infohash: NodeId,
        port: u16,
        implied_port: bool,
        token: Token,
    },
    PingReply {
        tid: TransactionId,
    },
    FindNodeReply {
        tid: TransactionId,
        nodes: Vec<CompactNode>,
        nodes6: Vec<CompactNode>,
    },
    GetPeersReply {
        tid: TransactionId,
        token: Token,
        nodes: Vec<CompactNode>,
        nodes6: Vec<CompactNode>,
        values: Vec<SocketAddr>,
    },
    Error {
        tid: TransactionId,
        code: i64,
        message: String,
    },
}

/// The KRPC bencode codec, implemented by `dht-node`. `dht-core` only
/// depends on this contract, never on a concrete bencode library.
pub trait Codec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> InboundMessage;
    fn encode(&self, local_id: NodeId, msg: &OutboundMessage) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_node_v4_round_trips() {
        let node = CompactNode {
            id: NodeId::random(),
            addr: "1.2.3.4:6881".parse().expect("valid addr"),
        };
        let bytes = node.encode();
        assert_eq!(bytes.len(), 26);
        let decoded = CompactNode::decode_v4(&bytes).expect("decodes");
        assert_eq!(decoded, node);
    }

    #[test]
    fn compact_node_v6_round_trips() {
        let node = CompactNode {
            id: NodeId::random(),
            addr: "[::1]:6881".parse().expect("valid addr"),
        };
        let bytes = node.encode();
        assert_eq!(bytes.len(), 38);
        let decoded = CompactNode::decode_v6(&bytes).expect("decodes");
        assert_eq!(decoded, node);
    }

    #[test]
    fn decode_list_parses_multiple_entries() {
        let a = CompactNode {
            id: NodeId::random(),
            addr: "1.2.3.4:6881".parse().expect("valid addr"),
        };
        let b = CompactNode {
            id: NodeId::random(),
            addr: "5.6.7.8:6882".parse().expect("valid addr"),
        };
        let mut bytes = a.encode();
        bytes.extend(b.encode());
        let list = CompactNode::decode_list(&bytes, false);
        assert_eq!(list, vec![a, b]);
    }
}
