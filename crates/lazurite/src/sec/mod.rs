//! Noise_IK_25519_ChaChaPoly_BLAKE2b: the handshake that authenticates both
//! peers and derives the two directional transport AEADs.

mod cipher;
mod handshake;
mod symmetric;

pub(crate) use cipher::TransportAead;
pub(crate) use handshake::{Handshake, Role};
