//! The shared UDP endpoint.
//!
//! All connections and the handshake path write through one socket; the
//! kernel serializes the sends. Batched sends take one buffer holding
//! several packets laid out back to back at a fixed segment size, the
//! portable equivalent of generic segmentation offload.

use crate::protocol::MAX_PACKET_SIZE;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

pub(crate) struct Endpoint {
    socket: UdpSocket,
}

impl Endpoint {
    pub async fn bind(laddr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(laddr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub async fn send_to(&self, buf: &[u8], raddr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, raddr).await
    }

    /// Sends `buf` as consecutive datagrams of `segment_size` bytes; only
    /// the final one may be shorter.
    pub async fn send_segmented(
        &self,
        buf: &[u8],
        segment_size: usize,
        raddr: SocketAddr,
    ) -> io::Result<usize> {
        debug_assert!((1200..=MAX_PACKET_SIZE).contains(&segment_size));
        let mut sent = 0;
        for segment in buf.chunks(segment_size) {
            sent += self.socket.send_to(segment, raddr).await?;
        }
        Ok(sent)
    }
}
