//! Error kinds, per the propagation policy: peer-level failures never
//! surface to search callers, they just thin out the result set.

use crate::id::NodeId;

pub type Result<T> = std::result::Result<T, DhtError>;

#[derive(thiserror::Error, Debug)]
pub enum DhtError {
    #[error("token mismatch for announce_peer from {ip}:{port}")]
    TokenMismatch { ip: std::net::IpAddr, port: u16 },

    #[error("malformed datagram from {from}: {reason}")]
    MalformedDatagram {
        from: std::net::SocketAddr,
        reason: String,
    },

    #[error("no address family enabled (ipv4 and ipv6 both false)")]
    NoAddressFamily,

    #[error("bucket for {id:?} is full and holds no bad nodes")]
    BucketFull { id: NodeId },

    #[error("search {tid:?} not found (timed out, cancelled, or unknown tid)")]
    SearchNotFound { tid: crate::wire::TransactionId },

    #[error("bootstrap hostname {host} did not resolve: {reason}")]
    ResolutionError { host: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let e = DhtError::NoAddressFamily;
        assert_eq!(e.to_string(), "no address family enabled (ipv4 and ipv6 both false)");
    }
}
