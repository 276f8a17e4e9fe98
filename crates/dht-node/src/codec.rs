//! Translates between the bencoded [`krpc`](crate::krpc) wire shapes and
//! `dht-core`'s transport-agnostic [`InboundMessage`]/`OutboundMessage`,
//! implementing the [`dht_core::wire::Codec`] contract `dht-core` asks
//! its transport to fulfill.

use dht_core::id::NodeId;
use dht_core::token::Token;
use dht_core::wire::{Codec, CompactNode, InboundMessage, OutboundMessage, TransactionId};
use serde_bytes::ByteBuf;
use tracing::debug;

use crate::krpc::{Body, Envelope, KrpcError, Query, Response};

pub struct BencodeCodec;

impl Codec for BencodeCodec {
    fn decode(&self, bytes: &[u8]) -> InboundMessage {
        match serde_bencode::de::from_bytes::<Envelope>(bytes) {
            Ok(envelope) => decode_envelope(envelope),
            Err(e) => InboundMessage::Invalid { reason: e.to_string() },
        }
    }

    fn encode(&self, local_id: NodeId, msg: &OutboundMessage) -> Vec<u8> {
        let envelope = encode_envelope(local_id, msg);
        match serde_bencode::ser::to_bytes(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Every `OutboundMessage` we build ourselves should always
                // encode; a failure here means a logic bug, not bad input.
                debug!(error = %e, "failed to bencode outbound message");
                Vec::new()
            }
        }
    }
}

fn decode_envelope(envelope: Envelope) -> InboundMessage {
    let tid = TransactionId(envelope.transaction_id);
    match envelope.body {
        Body::Query { query } => decode_query(tid, query),
        Body::Response { response } => decode_response(tid, response),
        Body::Error { error: KrpcError(code, message) } => {
            InboundMessage::ErrorReply { tid: Some(tid), code, message }
        }
    }
}

fn decode_query(tid: TransactionId, query: Query) -> InboundMessage {
    match query {
        Query::Ping { id } => match node_id(&id) {
            Some(sender) => InboundMessage::Ping { tid, sender },
            None => invalid("ping: bad id length"),
        },
        Query::FindNode { id, target, want } => match (node_id(&id), node_id(&target)) {
            (Some(sender), Some(target)) => {
                InboundMessage::FindNode { tid, sender, target, want_v6: wants_v6(&want) }
            }
            _ => invalid("find_node: bad id/target length"),
        },
        Query::GetPeers { id, info_hash, want } => match (node_id(&id), node_id(&info_hash)) {
            (Some(sender), Some(infohash)) => {
                InboundMessage::GetPeers { tid, sender, infohash, want_v6: wants_v6(&want) }
            }
            _ => invalid("get_peers: bad id/info_hash length"),
        },
        Query::AnnouncePeer { id, info_hash, port, implied_port, token } => {
            match (node_id(&id), node_id(&info_hash), token_from(&token)) {
                (Some(sender), Some(infohash), Some(token)) => InboundMessage::AnnouncePeer {
                    tid,
                    sender,
                    infohash,
                    port,
                    implied_port: implied_port != 0,
                    token,
                },
                _ => invalid("announce_peer: bad id/info_hash/token length"),
            }
        }
    }
}

fn decode_response(tid: TransactionId, response: Response) -> InboundMessage {
    let Some(sender) = node_id(&response.id) else {
        return invalid("response: bad id length");
    };
    let nodes = response.nodes.as_deref().map(|b| CompactNode::decode_list(b, false)).unwrap_or_default();
    let nodes6 = response.nodes6.as_deref().map(|b| CompactNode::decode_list(b, true)).unwrap_or_default();
    match (&response.token, &response.values) {
        (None, None) if nodes.is_empty() && nodes6.is_empty() => InboundMessage::PingReply { tid, sender },
        (None, None) => InboundMessage::FindNodeReply { tid, sender, nodes, nodes6 },
        (token, values) => InboundMessage::GetPeersReply {
            tid,
            sender,
            token: token.as_ref().and_then(token_from),
            nodes,
            nodes6,
            values: values
                .as_ref()
                .map(|vs| vs.iter().filter_map(|v| decode_compact_value(v)).collect())
                .unwrap_or_default(),
        },
    }
}

fn encode_envelope(local_id: NodeId, msg: &OutboundMessage) -> Envelope {
    let id = ByteBuf::from(local_id.as_bytes().to_vec());
    let (tid, body) = match msg {
        OutboundMessage::Ping { tid } => {
            (tid.clone(), Body::Query { query: Query::Ping { id } })
        }
        OutboundMessage::FindNode { tid, target, want_v6 } => (
            tid.clone(),
            Body::Query {
                query: Query::FindNode {
                    id,
                    target: ByteBuf::from(target.as_bytes().to_vec()),
                    want: want_list(*want_v6),
                },
            },
        ),
        OutboundMessage::GetPeers { tid, infohash, want_v6 } => (
            tid.clone(),
            Body::Query {
                query: Query::GetPeers {
                    id,
                    info_hash: ByteBuf::from(infohash.as_bytes().to_vec()),
                    want: want_list(*want_v6),
                },
            },
        ),
        OutboundMessage::AnnouncePeer { tid, infohash, port, implied_port, token } => (
            tid.clone(),
            Body::Query {
                query: Query::AnnouncePeer {
                    id,
                    info_hash: ByteBuf::from(infohash.as_bytes().to_vec()),
                    port: *port,
                    implied_port: u8::from(*implied_port),
                    token: ByteBuf::from(token.0.to_vec()),
                },
            },
        ),
        OutboundMessage::PingReply { tid } => (
            tid.clone(),
            Body::Response { response: Response { id, token: None, nodes: None, nodes6: None, values: None } },
        ),
        OutboundMessage::FindNodeReply { tid, nodes, nodes6 } => (
            tid.clone(),
            Body::Response {
                response: Response {
                    id,
                    token: None,
                    nodes: encode_compact_list(nodes),
                    nodes6: encode_compact_list(nodes6),
                    values: None,
                },
            },
        ),
        OutboundMessage::GetPeersReply { tid, token, nodes, nodes6, values } => (
            tid.clone(),
            Body::Response {
                response: Response {
                    id,
                    token: Some(ByteBuf::from(token.0.to_vec())),
                    nodes: encode_compact_list(nodes),
                    nodes6: encode_compact_list(nodes6),
                    values: if values.is_empty() {
                        None
                    } else {
                        Some(values.iter().map(encode_compact_value).collect())
                    },
                },
            },
        ),
        OutboundMessage::Error { tid, code, message } => {
            (tid.clone(), Body::Error { error: KrpcError(*code, message.clone()) })
        }
    };
    Envelope { transaction_id: tid.0, body, read_only: false }
}

fn node_id(buf: &ByteBuf) -> Option<NodeId> {
    let bytes: [u8; 20] = buf.as_slice().try_into().ok()?;
    Some(NodeId::from_bytes(bytes))
}

fn token_from(buf: &ByteBuf) -> Option<Token> {
    let bytes: [u8; 20] = buf.as_slice().try_into().ok()?;
    Some(Token(bytes))
}

fn wants_v6(want: &[String]) -> bool {
    want.iter().any(|w| w == "n6")
}

fn want_list(want_v6: bool) -> Vec<String> {
    if want_v6 {
        vec!["n4".to_string(), "n6".to_string()]
    } else {
        Vec::new()
    }
}

fn encode_compact_list(nodes: &[CompactNode]) -> Option<ByteBuf> {
    if nodes.is_empty() {
        return None;
    }
    let mut bytes = Vec::new();
    for node in nodes {
        bytes.extend(node.encode());
    }
    Some(ByteBuf::from(bytes))
}

fn decode_compact_value(buf: &ByteBuf) -> Option<std::net::SocketAddr> {
    let bytes = buf.as_slice();
    if bytes.len() == 6 {
        let ip = std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Some(std::net::SocketAddr::new(std::net::IpAddr::V4(ip), port))
    } else if bytes.len() == 18 {
        let mut ip_bytes = [0u8; 16];
        ip_bytes.copy_from_slice(&bytes[0..16]);
        let ip = std::net::Ipv6Addr::from(ip_bytes);
        let port = u16::from_be_bytes([bytes[16], bytes[17]]);
        Some(std::net::SocketAddr::new(std::net::IpAddr::V6(ip), port))
    } else {
        None
    }
}

fn encode_compact_value(addr: &std::net::SocketAddr) -> ByteBuf {
    let mut bytes = Vec::new();
    match addr.ip() {
        std::net::IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
        std::net::IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
    }
    bytes.extend_from_slice(&addr.port().to_be_bytes());
    ByteBuf::from(bytes)
}

fn invalid(reason: &str) -> InboundMessage {
    InboundMessage::Invalid { reason: reason.to_string() }
}
