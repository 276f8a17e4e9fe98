//! The bencoded KRPC wire format (BEP 5), independent of how it maps
//! onto [`dht_core::wire::InboundMessage`]/`OutboundMessage` — that
//! translation lives in [`crate::codec`].

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Top-level KRPC message envelope: `t` (transaction id), `y` (message
/// type discriminant, folded into `body` via `#[serde(flatten)]`), and
/// the optional BEP-43 read-only flag.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(flatten)]
    pub body: Body,
    #[serde(rename = "ro", default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

fn is_false(b: &bool) -> bool {
    !b
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub enum Body {
    #[serde(rename = "q")]
    Query {
        #[serde(flatten)]
        query: Query,
    },
    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        response: Response,
    },
    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: KrpcError,
    },
}

/// `(code, message)`, per BEP 5's error list shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct KrpcError(pub i64, pub String);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
pub enum Query {
    #[serde(rename = "ping")]
    Ping { id: ByteBuf },
    #[serde(rename = "find_node")]
    FindNode {
        id: ByteBuf,
        target: ByteBuf,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        want: Vec<String>,
    },
    #[serde(rename = "get_peers")]
    GetPeers {
        id: ByteBuf,
        info_hash: ByteBuf,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        want: Vec<String>,
    },
    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        id: ByteBuf,
        info_hash: ByteBuf,
        port: u16,
        #[serde(default)]
        implied_port: u8,
        token: ByteBuf,
    },
}

/// Response bodies are untagged: the shape alone (distinguished by
/// which fields are present) tells the decoder which query it answers.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes6: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
}
