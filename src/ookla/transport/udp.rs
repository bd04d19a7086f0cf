//! UDP data channel of the packet-loss session.
//!
//! Datagrams are ASCII `LOSS <nonce> <seq> <uuid>`: the nonce is a random
//! 64-bit value fixed for the run, the sequence starts at 0 and increments
//! by one per datagram, and the uuid ties the stream to the TCP control
//! session.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};

use crate::errors::{Error, Result};

const NONCE_BOUND: i64 = 10_000_000_000;

/// Sender half of a packet-loss session.
pub struct PacketLossSender {
    id: String,
    uuid: String,
    nonce: i64,
    source: Option<IpAddr>,
    socket: Option<UdpSocket>,
}

impl PacketLossSender {
    /// Creates a sender for `uuid`, optionally binding to `source`.
    pub fn new(uuid: &str, source: Option<IpAddr>) -> Self {
        let nonce = rand::thread_rng().gen_range(0..NONCE_BOUND);

        PacketLossSender {
            id: uuid.to_uppercase(),
            uuid: uuid.to_string(),
            nonce,
            source,
            socket: None,
        }
    }

    /// Uppercased session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The run-scoped random nonce carried by every datagram.
    pub fn nonce(&self) -> i64 {
        self.nonce
    }

    /// Dials the UDP socket towards `host`.
    pub async fn connect(&mut self, host: &str) -> Result<()> {
        let mut addrs = lookup_host(host).await?;
        let peer = addrs.next().ok_or_else(|| {
            Error::Protocol(format!("no address found for {host}"))
        })?;

        let bind_addr = match (self.source, peer) {
            (Some(source), _) => SocketAddr::new(source, 0),
            (None, SocketAddr::V4(_)) => {
                SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
            }
            (None, SocketAddr::V6(_)) => {
                SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
            }
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        self.socket = Some(socket);

        Ok(())
    }

    /// Emits one datagram with sequence number `order`.
    pub async fn send(&self, order: i64) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;

        let payload =
            format!("LOSS {} {} {}", self.nonce, order, self.uuid);
        socket.send(payload.as_bytes()).await?;

        Ok(())
    }
}
