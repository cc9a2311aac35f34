use crate::sec::TransportAead;
use blake2::{Blake2b512, Digest};
use hmac::{Mac, SimpleHmac};

const PROTOCOL_NAME: &[u8] = b"Noise_IK_25519_ChaChaPoly_BLAKE2b";

/// BLAKE2b output length; also the chaining key and handshake hash length.
pub(crate) const HASH_LEN: usize = 64;

// BLAKE2 buffers lazily, which rules out the block-level `Hmac`.
type HmacBlake2b = SimpleHmac<Blake2b512>;

/// The SymmetricState object of Noise: the evolving chaining key, the
/// handshake hash, and the AEAD currently keyed from the chain (absent
/// before the first key material is mixed in, in which case sealing is the
/// identity).
pub(crate) struct Symmetric {
    aead: Option<TransportAead>,
    nonce: u64,
    chaining_key: [u8; HASH_LEN],
    hash: [u8; HASH_LEN],
}

impl Symmetric {
    pub fn new() -> Self {
        // The protocol name is shorter than the hash length, so the
        // initial hash is the zero-padded name rather than its digest.
        let mut hash = [0u8; HASH_LEN];
        hash[..PROTOCOL_NAME.len()].copy_from_slice(PROTOCOL_NAME);
        Self { aead: None, nonce: 0, chaining_key: hash, hash }
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Blake2b512::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    pub fn mix_key(&mut self, input_key_material: &[u8]) {
        let (output1, output2) = hkdf(&self.chaining_key, input_key_material);
        self.chaining_key = output1;
        self.aead = Some(TransportAead::new(output2[..32].try_into().expect("32-byte key")));
        self.nonce = 0;
    }

    /// Derives the two directional transport AEADs and returns them with
    /// the final handshake hash.
    pub fn split(&self) -> (TransportAead, TransportAead, [u8; HASH_LEN]) {
        let (output1, output2) = hkdf(&self.chaining_key, &[]);
        (
            TransportAead::new(output1[..32].try_into().expect("32-byte key")),
            TransportAead::new(output2[..32].try_into().expect("32-byte key")),
            self.hash,
        )
    }

    pub fn seal_and_hash(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = match &self.aead {
            Some(aead) => aead.seal(self.nonce, plaintext, &self.hash),
            None => plaintext.to_vec(),
        };
        self.mix_hash(&ciphertext);
        self.nonce += 1;
        ciphertext
    }

    pub fn open_and_hash(&mut self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let plaintext = match &self.aead {
            Some(aead) => aead.open(self.nonce, ciphertext, &self.hash)?,
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        self.nonce += 1;
        Some(plaintext)
    }
}

/// Noise HKDF over HMAC-BLAKE2b, two outputs.
fn hkdf(chaining_key: &[u8; HASH_LEN], input_key_material: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let mut mac = HmacBlake2b::new_from_slice(chaining_key).expect("hmac accepts any key length");
    mac.update(input_key_material);
    let temp_key = mac.finalize().into_bytes();

    let mut mac = HmacBlake2b::new_from_slice(&temp_key).expect("hmac accepts any key length");
    mac.update(&[0x01]);
    let output1: [u8; HASH_LEN] = mac.finalize().into_bytes().into();

    let mut mac = HmacBlake2b::new_from_slice(&temp_key).expect("hmac accepts any key length");
    mac.update(&output1);
    mac.update(&[0x02]);
    let output2: [u8; HASH_LEN] = mac.finalize().into_bytes().into();

    (output1, output2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_is_identity_before_key_material() {
        let mut a = Symmetric::new();
        let mut b = Symmetric::new();

        let ct = a.seal_and_hash(b"public");
        assert_eq!(ct, b"public");
        assert_eq!(b.open_and_hash(&ct).unwrap(), b"public");
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn seal_round_trips_after_mix_key() {
        let mut a = Symmetric::new();
        let mut b = Symmetric::new();
        a.mix_key(b"shared secret");
        b.mix_key(b"shared secret");

        let ct = a.seal_and_hash(b"payload");
        assert_ne!(ct, b"payload");
        assert_eq!(b.open_and_hash(&ct).unwrap(), b"payload");
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.chaining_key, b.chaining_key);
    }

    #[test]
    fn open_fails_on_diverged_hash() {
        let mut a = Symmetric::new();
        let mut b = Symmetric::new();
        a.mix_key(b"shared secret");
        b.mix_key(b"shared secret");
        b.mix_hash(b"divergence");

        let ct = a.seal_and_hash(b"payload");
        assert!(b.open_and_hash(&ct).is_none());
    }

    #[test]
    fn split_is_symmetric() {
        let mut a = Symmetric::new();
        let mut b = Symmetric::new();
        a.mix_key(b"ikm");
        b.mix_key(b"ikm");

        let (a1, a2, ah) = a.split();
        let (b1, b2, bh) = b.split();
        assert_eq!(ah, bh);

        let ct = a1.seal(0, b"x", &[]);
        assert_eq!(b1.open(0, &ct, &[]).unwrap(), b"x");
        let ct = a2.seal(0, b"y", &[]);
        assert_eq!(b2.open(0, &ct, &[]).unwrap(), b"y");
    }
}
