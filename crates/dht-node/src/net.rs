//! Dual-stack UDP transport. `dht-core::server::Server` is pure state —
//! it never touches a socket — so this owns the actual `UdpSocket`s and
//! the [`BencodeCodec`], turning `Server`'s `(SocketAddr, OutboundMessage)`
//! pairs into datagrams and datagrams back into `InboundMessage`s.

use std::net::{IpAddr, SocketAddr};

use dht_core::id::NodeId;
use dht_core::wire::{Codec, InboundMessage, OutboundMessage};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::codec::BencodeCodec;
use crate::error::{NodeError, Result};

/// KRPC messages are small; BEP 5 itself targets the ~1500 byte Ethernet
/// MTU. Double that leaves headroom for a `get_peers` reply packed with
/// `nodes`+`nodes6`+`values` without ever allocating per-datagram.
const MAX_DATAGRAM: usize = 4096;

struct BoundSocket {
    socket: UdpSocket,
}

impl BoundSocket {
    async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NodeError::SocketBind { addr, source })?;
        Ok(BoundSocket { socket })
    }

    /// Binds an IPv6 socket with `IPV6_V6ONLY` explicitly set before the
    /// bind call. The OS default (dual-stack on Linux) would otherwise
    /// have this socket also claim the v4 port, and the sibling v4 bind
    /// below would fail with `EADDRINUSE`.
    fn bind_v6_only(addr: SocketAddr) -> Result<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .and_then(|socket| {
                socket.set_only_v6(true)?;
                socket.set_nonblocking(true)?;
                socket.bind(&addr.into())?;
                Ok(socket)
            })
            .map_err(|source| NodeError::SocketBind { addr, source })?;
        let socket = UdpSocket::from_std(socket.into())
            .map_err(|source| NodeError::SocketBind { addr, source })?;
        Ok(BoundSocket { socket })
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        Ok((buf[..len].to_vec(), from))
    }

    async fn send(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
        self.socket.send_to(bytes, to).await?;
        Ok(())
    }
}

/// Binds whichever address families the config enables and routes
/// outbound datagrams to the matching socket by the destination's IP
/// version.
pub struct Transport {
    v4: Option<BoundSocket>,
    v6: Option<BoundSocket>,
    codec: BencodeCodec,
}

impl Transport {
    pub async fn bind(port: u16, ipv4: bool, ipv6: bool) -> Result<Self> {
        let v4 = if ipv4 {
            Some(BoundSocket::bind(SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port)).await?)
        } else {
            None
        };
        let v6 = if ipv6 {
            Some(BoundSocket::bind_v6_only(SocketAddr::new(
                IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                port,
            ))?)
        } else {
            None
        };
        Ok(Transport { v4, v6, codec: BencodeCodec })
    }

    /// Waits for the next datagram on whichever socket is bound,
    /// decoding it into an [`InboundMessage`]. Never returns for a
    /// transport with no sockets bound — `DhtConfig::validate` rules
    /// that configuration out before a `Transport` is ever built.
    pub async fn recv(&self) -> Result<(SocketAddr, InboundMessage)> {
        let (bytes, from) = match (&self.v4, &self.v6) {
            (Some(v4), Some(v6)) => {
                tokio::select! {
                    r = v4.recv() => r?,
                    r = v6.recv() => r?,
                }
            }
            (Some(v4), None) => v4.recv().await?,
            (None, Some(v6)) => v6.recv().await?,
            (None, None) => std::future::pending().await,
        };
        let msg = self.codec.decode(&bytes);
        Ok((from, msg))
    }

    /// Encodes and sends one outbound message, silently dropping it if
    /// the destination's family has no bound socket (e.g. a stale
    /// `nodes6` entry surviving an ipv6-disabled reconfiguration).
    pub async fn send(&self, local_id: NodeId, to: SocketAddr, msg: &OutboundMessage) {
        let socket = match to {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };
        let Some(socket) = socket else {
            debug!(%to, "dropping outbound datagram, address family not bound");
            return;
        };
        let bytes = self.codec.encode(local_id, msg);
        if let Err(e) = socket.send(&bytes, to).await {
            warn!(%to, error = %e, "failed to send datagram");
        }
    }

    /// Drains a batch of `(addr, msg)` pairs produced by the server,
    /// e.g. from `drain_outbound_queries`/`drain_announces`/`tick`.
    pub async fn send_all(&self, local_id: NodeId, batch: Vec<(SocketAddr, OutboundMessage)>) {
        for (addr, msg) in batch {
            self.send(local_id, addr, &msg).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_exchange_ping_over_loopback() {
        let a = Transport::bind(0, true, false).await.expect("bind a");
        let b = Transport::bind(0, true, false).await.expect("bind b");
        let a_addr = a.v4.as_ref().expect("v4 bound").socket.local_addr().expect("local addr");
        let b_id = NodeId::random();

        let codec = BencodeCodec;
        let bytes = codec.encode(
            b_id,
            &OutboundMessage::Ping { tid: dht_core::wire::TransactionId(vec![7]) },
        );
        b.v4.as_ref().expect("v4 bound").send(&bytes, a_addr).await.expect("send");

        let (from, msg) = a.recv().await.expect("recv");
        assert!(from.ip().is_loopback());
        match msg {
            InboundMessage::Ping { sender, .. } => assert_eq!(sender, b_id),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_unbound_family_is_a_noop() {
        let transport = Transport::bind(0, true, false).await.expect("bind");
        let local_id = NodeId::random();
        let v6_addr: SocketAddr = "[::1]:6881".parse().expect("valid addr");
        // Must not panic; there's no v6 socket to send on.
        transport
            .send(local_id, v6_addr, &OutboundMessage::Ping { tid: dht_core::wire::TransactionId(vec![1]) })
            .await;
    }
}
