//! One-time DH "CB" (confirmation box) encrypt/decrypt.
//!
//! The very first message on a fresh `Rq` (the `AgentConfirmation` envelope)
//! cannot yet use the ratchet — no root key has been established. It is
//! instead sealed with a one-time X25519 DH between the sender's ephemeral
//! key (carried in the envelope) and the recipient's queue DH key, run
//! through HKDF to a 32-byte AEAD key, then opened with
//! [`crate::aead::decrypt`]. This mirrors the ratchet's own `kdf_rk` step
//! but runs once, outside any chain.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::{error::CryptoError, kdf};

const CB_INFO: &[u8] = b"dl-agent-cb-v1";

/// Derive the one-time box key from our static secret and the peer's public key.
fn derive_box_key(our_secret: &StaticSecret, peer_public: &X25519Public) -> Result<[u8; 32], CryptoError> {
    let dh = our_secret.diffie_hellman(peer_public);
    kdf::derive_root_key(dh.as_bytes(), CB_INFO)
}

/// Encrypt `plaintext` under a fresh one-time DH between `our_secret` and
/// `peer_public`. Returns wire-format ciphertext (nonce || ct+tag).
pub fn box_encrypt(
    our_secret: &StaticSecret,
    peer_public: &X25519Public,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = derive_box_key(our_secret, peer_public)?;
    crate::aead::encrypt(&key, plaintext, aad)
}

/// Decrypt a one-time DH box sealed by [`box_encrypt`].
pub fn box_decrypt(
    our_secret: &StaticSecret,
    peer_public: &X25519Public,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = derive_box_key(our_secret, peer_public)?;
    crate::aead::decrypt(&key, ciphertext, aad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn box_roundtrip() {
        let alice_secret = StaticSecret::random_from_rng(OsRng);
        let bob_secret = StaticSecret::random_from_rng(OsRng);
        let alice_pub = X25519Public::from(&alice_secret);
        let bob_pub = X25519Public::from(&bob_secret);

        let ct = box_encrypt(&alice_secret, &bob_pub, b"confirmation body", b"hdr").unwrap();
        let pt = box_decrypt(&bob_secret, &alice_pub, &ct, b"hdr").unwrap();
        assert_eq!(&pt[..], b"confirmation body");
    }

    #[test]
    fn box_rejects_wrong_peer() {
        let alice_secret = StaticSecret::random_from_rng(OsRng);
        let bob_secret = StaticSecret::random_from_rng(OsRng);
        let mallory_secret = StaticSecret::random_from_rng(OsRng);
        let alice_pub = X25519Public::from(&alice_secret);
        let mallory_pub = X25519Public::from(&mallory_secret);

        let ct = box_encrypt(&alice_secret, &X25519Public::from(&bob_secret), b"body", b"").unwrap();
        assert!(box_decrypt(&mallory_secret, &alice_pub, &ct, b"").is_err());
        let _ = mallory_pub;
    }
}
