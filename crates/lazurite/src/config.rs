use std::fmt;

/// X25519 static private key.
#[derive(Clone)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// The public counterpart, presented to the remote party during the
    /// handshake.
    pub fn public(&self) -> PublicKey {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.write_str("PrivateKey(..)")
    }
}

/// X25519 static public key. Peers may discriminate and deny connections
/// based on the key presented during the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey(pub(crate) [u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Configures a [`Mux`](crate::Mux). A config must not be modified while in
/// use.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of the receive window used for reassembling the reliable byte
    /// stream. Must be non-zero.
    pub stream_receive_window: usize,

    /// Bounds how many bytes carrying reliable stream data can be in
    /// flight.
    pub max_stream_bytes_in_flight: usize,

    /// The static private key. The public counterpart is presented to the
    /// remote party during the handshake.
    pub private_key: PrivateKey,

    /// Accept incoming connections.
    pub listen: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_deterministic() {
        let key = PrivateKey::from_bytes([7u8; 32]);
        assert_eq!(key.public(), key.public());
        assert_ne!(key.public(), PrivateKey::from_bytes([8u8; 32]).public());
    }

    #[test]
    fn private_key_debug_hides_material() {
        let key = PrivateKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{key:?}"), "PrivateKey(..)");
    }
}
