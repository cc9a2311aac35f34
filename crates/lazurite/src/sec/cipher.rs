use crate::protocol::TAG_LEN;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};

/// ChaCha20-Poly1305 with the caller in charge of nonces: the 96-bit nonce
/// is the 64-bit counter little-endian with four leading zero bytes, as in
/// the ChaChaPoly cipher functions of Noise.
pub(crate) struct TransportAead {
    aead: ChaCha20Poly1305,
}

impl TransportAead {
    pub fn new(key: &[u8; 32]) -> Self {
        Self { aead: ChaCha20Poly1305::new(Key::from_slice(key)) }
    }

    fn nonce(n: u64) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&n.to_le_bytes());
        nonce.into()
    }

    /// Encrypts `buf[..plaintext_len]` in place and writes the tag right
    /// after it. Returns the sealed length. `buf` must have room for the
    /// tag.
    pub fn seal_in_place(
        &self,
        nonce: u64,
        additional_data: &[u8],
        buf: &mut [u8],
        plaintext_len: usize,
    ) -> usize {
        let tag = self
            .aead
            .encrypt_in_place_detached(&Self::nonce(nonce), additional_data, &mut buf[..plaintext_len])
            .expect("chacha20poly1305 seal");
        buf[plaintext_len..plaintext_len + TAG_LEN].copy_from_slice(&tag);
        plaintext_len + TAG_LEN
    }

    /// Decrypts `buf` (ciphertext followed by tag) in place. Returns the
    /// plaintext on success and `None` on authentication failure, leaving
    /// error handling (silently dropping the packet) to the caller.
    pub fn open_in_place<'a>(
        &self,
        nonce: u64,
        additional_data: &[u8],
        buf: &'a mut [u8],
    ) -> Option<&'a [u8]> {
        if buf.len() < TAG_LEN {
            return None;
        }
        let (data, tag) = buf.split_at_mut(buf.len() - TAG_LEN);
        self.aead
            .decrypt_in_place_detached(&Self::nonce(nonce), additional_data, data, Tag::from_slice(tag))
            .ok()?;
        Some(data)
    }

    /// Allocating variant used by the handshake.
    pub fn seal(&self, nonce: u64, plaintext: &[u8], additional_data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        self.seal_in_place(nonce, additional_data, &mut buf, plaintext.len());
        buf
    }

    /// Allocating variant used by the handshake.
    pub fn open(&self, nonce: u64, ciphertext: &[u8], additional_data: &[u8]) -> Option<Vec<u8>> {
        let mut buf = ciphertext.to_vec();
        let n = self.open_in_place(nonce, additional_data, &mut buf)?.len();
        buf.truncate(n);
        Some(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let aead = TransportAead::new(&[0x42; 32]);
        let sealed = aead.seal(7, b"plaintext", b"ad");
        assert_eq!(sealed.len(), 9 + TAG_LEN);
        assert_eq!(aead.open(7, &sealed, b"ad").unwrap(), b"plaintext");
    }

    #[test]
    fn rejects_wrong_nonce_ad_or_tampering() {
        let aead = TransportAead::new(&[0x42; 32]);
        let sealed = aead.seal(7, b"plaintext", b"ad");

        assert!(aead.open(8, &sealed, b"ad").is_none());
        assert!(aead.open(7, &sealed, b"da").is_none());

        let mut tampered = sealed.clone();
        *tampered.last_mut().unwrap() ^= 1;
        assert!(aead.open(7, &tampered, b"ad").is_none());

        assert!(aead.open(7, &sealed[..sealed.len() - 1], b"ad").is_none());
    }

    #[test]
    fn in_place_matches_allocating() {
        let aead = TransportAead::new(&[0x01; 32]);
        let mut buf = [0u8; 32];
        buf[..5].copy_from_slice(b"hello");
        let n = aead.seal_in_place(3, b"hdr", &mut buf, 5);
        assert_eq!(&buf[..n], &aead.seal(3, b"hello", b"hdr")[..]);

        let plain = aead.open_in_place(3, b"hdr", &mut buf[..n]).unwrap();
        assert_eq!(plain, b"hello");
    }
}
