// Copyright 2020 Joyent, Inc.

//! Datagram transport shared by clients and servers.
//!
//! Sends are best effort: `Ok` only means the datagram was handed to the
//! socket. Inbound datagrams may be lost, duplicated or reordered.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::codec::BytesCodec;
use tokio_util::udp::UdpFramed;

use crate::error::{FastError, Result};

/// Stream of `(peer, datagram)` pairs read from a bound socket.
pub type Inbound = BoxStream<'static, Result<(SocketAddr, Bytes)>>;

/// A bound UDP endpoint.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(address: &str) -> Result<UdpTransport> {
        let socket = UdpSocket::bind(address).await.map_err(|e| FastError::Bind {
            address: address.to_string(),
            source: e,
        })?;
        let local_addr = socket.local_addr().map_err(|e| FastError::Bind {
            address: address.to_string(),
            source: e,
        })?;

        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand one datagram to the socket.
    pub async fn send(&self, peer: SocketAddr, datagram: &[u8]) -> Result<()> {
        self.socket
            .send_to(datagram, peer)
            .await
            .map(|_| ())
            .map_err(|e| FastError::SendFailed { peer, source: e })
    }

    /// Lazily read datagrams from the socket.
    ///
    /// Every datagram is yielded once to whoever polls the returned stream,
    /// so a transport should have a single reader.
    pub fn incoming(&self) -> Inbound {
        UdpFramed::new(Arc::clone(&self.socket), BytesCodec::new())
            .map(|item| match item {
                Ok((datagram, peer)) => Ok((peer, datagram.freeze())),
                Err(e) => Err(FastError::Receive(e)),
            })
            .boxed()
    }
}

/// Resolve `host:port` to the first matching socket address.
pub async fn resolve(address: &str) -> Result<SocketAddr> {
    let invalid = |reason: String| FastError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    let mut addrs = lookup_host(address).await.map_err(|e| invalid(e.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| invalid(String::from("no addresses found")))
}
