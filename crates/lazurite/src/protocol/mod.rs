//! Wire-level constants and identifiers shared by the mux, the handshaker
//! and the connection engine.

use std::fmt;
use std::time::Duration;

pub mod frame;
pub mod packet_number;

/// Upper bound on the size of packets received and sent over the underlying
/// UDP socket, and the required size of an initial handshake packet.
///
/// Peers must agree on this value, on [`MAX_ACK_DELAY`] and on
/// [`NOISE_PROLOGUE`] to establish a connection.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Delay before sending an ACK in response to an in-order packet.
pub const MAX_ACK_DELAY: Duration = Duration::from_millis(40);

/// Granularity of the loss-detection timers.
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(5);

/// Prologue string mixed into the Noise handshake.
pub const NOISE_PROLOGUE: &[u8] = b"Lazuli Noise Prologue";

/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;

/// Packet type tag carried in the top two bits of the first header byte.
pub const HANDSHAKE_PACKET: u8 = 0x00;
pub const RETRY_PACKET: u8 = 0x40;
pub const DATA_PACKET: u8 = 0xc0;

/// Mask selecting the packet type tag.
pub const PACKET_TAG_MASK: u8 = 0xc0;

/// Connection identifier: eight random bytes with the top two bits of the
/// first byte cleared, since those carry the packet type tag on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId([u8; 8]);

impl ConnId {
    /// Reads an id from the first eight bytes of a packet header, clearing
    /// the packet type tag.
    pub fn from_wire(header: &[u8]) -> Self {
        let mut id: [u8; 8] = header[..8].try_into().expect("header shorter than 8 bytes");
        id[0] &= !PACKET_TAG_MASK;
        Self(id)
    }

    pub fn random() -> Self {
        let mut id: [u8; 8] = rand::random();
        id[0] &= !PACKET_TAG_MASK;
        Self(id)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnId({self})")
    }
}
