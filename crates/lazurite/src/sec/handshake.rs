use crate::error::Error;
use crate::sec::TransportAead;
use crate::sec::symmetric::{HASH_LEN, Symmetric};
use x25519_dalek::{PublicKey, StaticSecret};

const DH_LEN: usize = 32;
const TAG_LEN: usize = crate::protocol::TAG_LEN;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

/// One side of a Noise_IK handshake.
///
/// IK is a two-message pattern: the initiator, who must already know the
/// responder's static public key, sends `e, es, s, ss`; the responder
/// answers `e, ee, se`. Afterwards [`Handshake::split`] yields the two
/// directional transport ciphers.
///
/// The ephemeral secret is injected at construction rather than drawn
/// internally, which keeps the exchange deterministic under test.
pub(crate) struct Handshake {
    symmetric: Symmetric,
    role: Role,
    local_static: StaticSecret,
    local_ephemeral: Option<StaticSecret>,
    ephemeral_secret: [u8; 32],
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
}

impl Handshake {
    /// `remote_static_public` is required for the initiator and ignored
    /// for the responder, who learns it from the first message.
    pub fn new(
        prologue: &[u8],
        local_static_private: &[u8; 32],
        remote_static_public: Option<&[u8; 32]>,
        ephemeral_secret: [u8; 32],
        role: Role,
    ) -> Self {
        let mut hs = Self {
            symmetric: Symmetric::new(),
            role,
            local_static: StaticSecret::from(*local_static_private),
            local_ephemeral: None,
            ephemeral_secret,
            remote_static: remote_static_public.map(|pk| PublicKey::from(*pk)),
            remote_ephemeral: None,
        };
        hs.symmetric.mix_hash(prologue);

        // IK pre-message: the responder's static key is mixed into the
        // hash before the first message flows.
        match role {
            Role::Initiator => {
                let rs = hs.remote_static.expect("initiator needs the remote static key");
                let _ = hs.symmetric.open_and_hash(rs.as_bytes());
            }
            Role::Responder => {
                let s_pub = PublicKey::from(&hs.local_static);
                hs.symmetric.seal_and_hash(s_pub.as_bytes());
            }
        }
        hs
    }

    /// Produces this side's handshake message carrying `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let e = StaticSecret::from(self.ephemeral_secret);
        let e_pub = PublicKey::from(&e);

        let mut out = Vec::with_capacity(DH_LEN * 2 + TAG_LEN * 2 + payload.len() + TAG_LEN);
        out.extend_from_slice(e_pub.as_bytes());
        self.symmetric.mix_hash(e_pub.as_bytes());

        match self.role {
            Role::Initiator => {
                // -> e, es, s, ss
                let rs = self.remote_static.ok_or(Error::Handshake("missing remote static key"))?;
                self.symmetric.mix_key(&dh(&e, &rs)?);

                let s_pub = PublicKey::from(&self.local_static);
                out.extend_from_slice(&self.symmetric.seal_and_hash(s_pub.as_bytes()));

                self.symmetric.mix_key(&dh(&self.local_static, &rs)?);
            }
            Role::Responder => {
                // <- e, ee, se
                let re =
                    self.remote_ephemeral.ok_or(Error::Handshake("responding before first message"))?;
                self.symmetric.mix_key(&dh(&e, &re)?);

                let rs = self.remote_static.ok_or(Error::Handshake("missing remote static key"))?;
                self.symmetric.mix_key(&dh(&e, &rs)?);
            }
        }

        out.extend_from_slice(&self.symmetric.seal_and_hash(payload));
        self.local_ephemeral = Some(e);
        Ok(out)
    }

    /// Consumes the peer's handshake message and returns its payload,
    /// which is `payload_len` bytes long.
    pub fn read_message(&mut self, mut msg: &[u8], payload_len: usize) -> Result<Vec<u8>, Error> {
        fn take<'a>(msg: &mut &'a [u8], n: usize) -> Result<&'a [u8], Error> {
            if msg.len() < n {
                return Err(Error::Handshake("short handshake message"));
            }
            let (head, rest) = msg.split_at(n);
            *msg = rest;
            Ok(head)
        }

        let re = PublicKey::from(<[u8; 32]>::try_from(take(&mut msg, DH_LEN)?).expect("32-byte key"));
        self.symmetric.mix_hash(re.as_bytes());

        match self.role {
            Role::Responder => {
                // -> e, es, s, ss
                self.symmetric.mix_key(&dh(&self.local_static, &re)?);

                let sealed_rs = take(&mut msg, DH_LEN + TAG_LEN)?;
                let rs_bytes = self
                    .symmetric
                    .open_and_hash(sealed_rs)
                    .ok_or(Error::Handshake("decryption failed"))?;
                let rs =
                    PublicKey::from(<[u8; 32]>::try_from(&rs_bytes[..]).expect("32-byte key"));

                self.symmetric.mix_key(&dh(&self.local_static, &rs)?);
                self.remote_static = Some(rs);
            }
            Role::Initiator => {
                // <- e, ee, se
                let e = self
                    .local_ephemeral
                    .as_ref()
                    .ok_or(Error::Handshake("reading reply before sending"))?;
                self.symmetric.mix_key(&dh(e, &re)?);
                self.symmetric.mix_key(&dh(&self.local_static, &re)?);
            }
        }
        self.remote_ephemeral = Some(re);

        let sealed_payload = take(&mut msg, payload_len + TAG_LEN)?;
        self.symmetric
            .open_and_hash(sealed_payload)
            .ok_or(Error::Handshake("decryption failed"))
    }

    /// The peer's authenticated static public key.
    pub fn remote_static_public_key(&self) -> Option<[u8; 32]> {
        self.remote_static.map(|pk| *pk.as_bytes())
    }

    /// Derives the transport ciphers. The first seals initiator-to-
    /// responder traffic, the second the reverse direction.
    pub fn split(&self) -> (TransportAead, TransportAead, [u8; HASH_LEN]) {
        self.symmetric.split()
    }
}

fn dh(secret: &StaticSecret, public: &PublicKey) -> Result<[u8; 32], Error> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(Error::Handshake("low-order remote public key"));
    }
    Ok(shared.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Handshake, Handshake) {
        let alice_static = [0x11; 32];
        let bob_static = [0x22; 32];
        let bob_public = *PublicKey::from(&StaticSecret::from(bob_static)).as_bytes();

        let alice = Handshake::new(
            b"test prologue",
            &alice_static,
            Some(&bob_public),
            [0x33; 32],
            Role::Initiator,
        );
        let bob = Handshake::new(b"test prologue", &bob_static, None, [0x44; 32], Role::Responder);
        (alice, bob)
    }

    #[test]
    fn complete_exchange() {
        let (mut alice, mut bob) = pair();

        let msg_a = alice.write_message(b"hi bob").unwrap();
        assert_eq!(msg_a.len(), 32 + (32 + 16) + (6 + 16));
        assert_eq!(bob.read_message(&msg_a, 6).unwrap(), b"hi bob");

        // The responder learned and authenticated the initiator's static
        // key.
        let alice_public = *PublicKey::from(&StaticSecret::from([0x11; 32])).as_bytes();
        assert_eq!(bob.remote_static_public_key(), Some(alice_public));

        let msg_b = bob.write_message(b"hi").unwrap();
        assert_eq!(msg_b.len(), 32 + (2 + 16));
        assert_eq!(alice.read_message(&msg_b, 2).unwrap(), b"hi");

        let (a1, a2, alice_hash) = alice.split();
        let (b1, b2, bob_hash) = bob.split();
        assert_eq!(alice_hash, bob_hash);

        // c1 carries initiator-to-responder traffic, c2 the reverse, with
        // independent nonce sequences.
        for nonce in 0..2 {
            let ct = a1.seal(nonce, b"a to b", &[]);
            assert_eq!(b1.open(nonce, &ct, &[]).unwrap(), b"a to b");

            let ct = b2.seal(nonce, b"b to a", &[]);
            assert_eq!(a2.open(nonce, &ct, &[]).unwrap(), b"b to a");
        }
    }

    #[test]
    fn wrong_responder_key_fails() {
        let alice_static = [0x11; 32];
        let not_bobs_public = *PublicKey::from(&StaticSecret::from([0x99; 32])).as_bytes();
        let mut alice = Handshake::new(
            b"test prologue",
            &alice_static,
            Some(&not_bobs_public),
            [0x33; 32],
            Role::Initiator,
        );
        let mut bob =
            Handshake::new(b"test prologue", &[0x22; 32], None, [0x44; 32], Role::Responder);

        let msg_a = alice.write_message(&[]).unwrap();
        assert!(bob.read_message(&msg_a, 0).is_err());
    }

    #[test]
    fn prologue_mismatch_fails() {
        let (mut alice, _) = pair();
        let mut bob =
            Handshake::new(b"other prologue", &[0x22; 32], None, [0x44; 32], Role::Responder);

        let msg_a = alice.write_message(&[]).unwrap();
        assert!(bob.read_message(&msg_a, 0).is_err());
    }

    #[test]
    fn tampered_message_fails() {
        let (mut alice, mut bob) = pair();
        let mut msg_a = alice.write_message(b"payload").unwrap();
        *msg_a.last_mut().unwrap() ^= 1;
        assert!(bob.read_message(&msg_a, 7).is_err());
    }

    #[test]
    fn deterministic_given_fixed_keys() {
        let (mut alice1, _) = pair();
        let (mut alice2, _) = pair();
        assert_eq!(
            alice1.write_message(b"same").unwrap(),
            alice2.write_message(b"same").unwrap()
        );
    }
}
