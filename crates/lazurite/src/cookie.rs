//! Anti-amplification cookies for the handshake path.
//!
//! A cookie is an XChaCha20-Poly1305 seal over an empty plaintext with the
//! peer's address string as additional data: 24 bytes of random nonce
//! followed by the 16-byte tag. Verifying one proves the presenter supplied
//! this address recently, since the mux rotates the key every couple of
//! minutes.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = crate::protocol::TAG_LEN;

/// Length of a cookie on the wire.
pub(crate) const COOKIE_LEN: usize = NONCE_LEN + TAG_LEN;

pub(crate) struct Authenticator {
    aead: XChaCha20Poly1305,
}

impl Authenticator {
    /// Creates an authenticator with a fresh random key.
    pub fn new() -> Self {
        let key: [u8; 32] = rand::random();
        Self { aead: XChaCha20Poly1305::new(&key.into()) }
    }

    /// Produces a cookie bound to `additional_data`.
    pub fn sign(&self, additional_data: &[u8]) -> Vec<u8> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let tag = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: &[], aad: additional_data })
            .expect("xchacha20poly1305 seal");

        let mut cookie = Vec::with_capacity(COOKIE_LEN);
        cookie.extend_from_slice(&nonce);
        cookie.extend_from_slice(&tag);
        cookie
    }

    /// Probabilistically tests whether `cookie` was produced by this
    /// authenticator for `additional_data`.
    pub fn verify(&self, cookie: &[u8], additional_data: &[u8]) -> bool {
        if cookie.len() != COOKIE_LEN {
            return false;
        }
        let (nonce, tag) = cookie.split_at(NONCE_LEN);
        self.aead
            .decrypt(XNonce::from_slice(nonce), Payload { msg: tag, aad: additional_data })
            .is_ok()
    }
}
