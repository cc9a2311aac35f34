//! The client side of the connection establishment dance: sends the padded
//! initial packet carrying a cookie and the first Noise message, then waits
//! for either the responder's Noise reply or a retry cookie.

use crate::error::{Error, Result};
use crate::mux::MuxShared;
use crate::protocol::{
    ConnId, DATA_PACKET, HANDSHAKE_PACKET, MAX_PACKET_SIZE, PACKET_TAG_MASK, RETRY_PACKET,
};
use crate::sec::Handshake;
use lazuli_binary::Writer;
use log::trace;
use std::net::SocketAddr;
use tokio::sync::mpsc;

pub(crate) struct Handshaker {
    id: ConnId,
    raddr: SocketAddr,
    in_tx: mpsc::Sender<Vec<u8>>,
    in_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Handshaker {
    pub fn new(id: ConnId, raddr: SocketAddr) -> Self {
        let (in_tx, in_rx) = mpsc::channel(1);
        Self { id, raddr, in_tx, in_rx: tokio::sync::Mutex::new(in_rx) }
    }

    /// Called from the mux's dispatch path; must not block.
    pub fn handle_packet(&self, p: &[u8]) {
        let _ = self.in_tx.try_send(p.to_vec());
    }

    /// Drives the two-message exchange once. On `Error::Again` the caller
    /// redials: the fresh cookie is already in the jar.
    pub async fn handshake(&self, mux: &MuxShared, hs: &mut Handshake) -> Result<()> {
        // The initial packet is padded to the maximum packet size so a
        // server cannot be used for traffic amplification.
        let mut buf = [0u8; MAX_PACKET_SIZE];
        buf[..8].copy_from_slice(self.id.as_bytes());
        buf[0] |= HANDSHAKE_PACKET;
        {
            let mut w = Writer::new(&mut buf[8..]);
            let cookie = mux.jar.get(&self.raddr).map(|c| c.value().clone()).unwrap_or_default();
            w.write_length_prefixed(&cookie)
                .map_err(|_| Error::Handshake("initial packet overflow"))?;
            let msg = hs.write_message(&[])?;
            w.write_length_prefixed(&msg)
                .map_err(|_| Error::Handshake("initial packet overflow"))?;
        }
        mux.endpoint.send_to(&buf, self.raddr).await?;
        trace!("[{}] sent initial packet to {}", self.id, self.raddr);

        let p = self.in_rx.lock().await.recv().await.ok_or(Error::Closed)?;

        // The mux only routes retry and data packets here.
        match p[0] & PACKET_TAG_MASK {
            RETRY_PACKET => {
                trace!("[{}] got retry cookie from {}", self.id, self.raddr);
                mux.jar.insert(self.raddr, p[8..].to_vec());
                Err(Error::Again)
            }
            DATA_PACKET => {
                hs.read_message(&p[8..], 0)?;
                Ok(())
            }
            _ => Err(Error::Protocol("unexpected packet during handshake".into())),
        }
    }
}
