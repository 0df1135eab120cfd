//! Thin facade over `agent_crypto` (§4.2) — the only module in this crate
//! allowed to touch ratchet/X3DH state directly. Everything else talks to
//! ciphertext through here so a single file bounds the crypto surface.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use agent_crypto::{
    cb, hash,
    identity::{IdentityKeyPair, PublicKeyBytes},
    ratchet::{RatchetHeader, RatchetSession},
    x3dh::{self, PrekeyBundle, X3DHHeader, X3DHResult},
    CryptoError,
};

/// A key-pair generation request. The agent only ever needs X25519 (DH) or
/// Ed25519 (signing) keys — never both from one call.
pub enum KeyAlg {
    X25519,
    Ed25519,
}

pub enum GeneratedKeyPair {
    X25519 { secret: StaticSecret, public: X25519Public },
    Ed25519(IdentityKeyPair),
}

pub fn generate_key_pair(alg: KeyAlg) -> Result<GeneratedKeyPair, CryptoError> {
    match alg {
        KeyAlg::X25519 => {
            let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
            let public = X25519Public::from(&secret);
            Ok(GeneratedKeyPair::X25519 { secret, public })
        }
        KeyAlg::Ed25519 => Ok(GeneratedKeyPair::Ed25519(IdentityKeyPair::generate()?)),
    }
}

pub fn dh(our_secret: &StaticSecret, peer_public: &X25519Public) -> [u8; 32] {
    *our_secret.diffie_hellman(peer_public).as_bytes()
}

/// Content hash used for hash-chain links and message IDs (BLAKE3, not
/// SHA-256 — the teacher's `hash` module standardised on BLAKE3 throughout).
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    hash::hash(data)
}

pub fn signing_key_pair() -> Result<IdentityKeyPair, CryptoError> {
    IdentityKeyPair::generate()
}

pub fn verify(public: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    IdentityKeyPair::verify(public, msg, sig)
}

// ── Ratchet ──────────────────────────────────────────────────────────────────

/// Encrypt one message with the next sending-chain key. The caller feeds
/// `header` + ciphertext to the wire codec; `rc` is mutated in place and
/// must be persisted by the caller afterwards (`RatchetSession::to_bytes`).
pub fn ratchet_encrypt(
    rc: &mut RatchetSession,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
    let (header, mk) = rc.encrypt_step()?;
    let ciphertext = agent_crypto::aead::encrypt(&mk, plaintext, aad)?;
    Ok((header, ciphertext))
}

/// Decrypt one message, advancing the receiving chain (and the DH ratchet,
/// if the header carries a new public key). `rc` is mutated in place;
/// skipped keys accumulated along the way live inside `rc` and are
/// persisted as part of its serialized state — there is no separate diff
/// to thread back to the caller.
pub fn ratchet_decrypt(
    rc: &mut RatchetSession,
    header: &RatchetHeader,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mk = rc.decrypt_step(header)?;
    agent_crypto::aead::decrypt(&mk, ciphertext, aad)
}

// ── X3DH ─────────────────────────────────────────────────────────────────────

/// `sndSide` — the connection initiator, fetching the peer's published
/// prekey bundle and starting a fresh session.
pub fn x3dh_snd_side(
    my_user_id: &str,
    my_ik: &IdentityKeyPair,
    peer_bundle: &PrekeyBundle,
) -> Result<X3DHResult, CryptoError> {
    x3dh::initiate(my_user_id, my_ik, peer_bundle)
}

/// `rcvSide` — the connection acceptor, reconstructing the shared secret
/// from the initiator's header carried in the first confirmation.
pub fn x3dh_rcv_side(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    sender_ik_pub: &PublicKeyBytes,
    header: &X3DHHeader,
) -> Result<[u8; 32], CryptoError> {
    let sender_ik_ed: [u8; 32] = sender_ik_pub
        .0
        .clone()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("sender identity key not 32 bytes".into()))?;
    x3dh::respond(my_ik, my_spk_secret, my_opk_secret, &sender_ik_ed, header)
}

// ── One-time confirmation box ───────────────────────────────────────────────

/// Opens the very first envelope on a fresh queue, before any ratchet root
/// key exists.
pub fn box_decrypt(
    our_secret: &StaticSecret,
    peer_public: &X25519Public,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    cb::box_decrypt(our_secret, peer_public, ciphertext, aad)
}

pub fn box_encrypt(
    our_secret: &StaticSecret,
    peer_public: &X25519Public,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    cb::box_encrypt(our_secret, peer_public, plaintext, aad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_crypto::x3dh::generate_signed_prekey;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    #[test]
    fn ratchet_encrypt_decrypt_via_mediator() {
        let shared_key = [7u8; 32];
        let bob_spk = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let bob_spk_pub = X25519Public::from(&bob_spk);

        let mut alice =
            RatchetSession::init_alice("s".into(), "bob".into(), shared_key, &bob_spk_pub).unwrap();
        let mut bob =
            RatchetSession::init_bob("s".into(), "alice".into(), shared_key, &bob_spk, &bob_spk_pub)
                .unwrap();

        let (header, ct) = ratchet_encrypt(&mut alice, b"hello bob", b"aad").unwrap();
        let pt = ratchet_decrypt(&mut bob, &header, &ct, b"aad").unwrap();
        assert_eq!(&pt[..], b"hello bob");
    }

    #[test]
    fn ratchet_state_survives_bincode_roundtrip() {
        let shared_key = [3u8; 32];
        let bob_spk = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let bob_spk_pub = X25519Public::from(&bob_spk);
        let mut alice =
            RatchetSession::init_alice("s".into(), "bob".into(), shared_key, &bob_spk_pub).unwrap();
        let (_h, _mk) = alice.encrypt_step().unwrap();

        let bytes = alice.to_bytes().unwrap();
        let restored = RatchetSession::from_bytes(&bytes).unwrap();
        assert_eq!(restored.send_n, alice.send_n);
    }

    #[test]
    fn x3dh_via_mediator_round_trips() {
        let alice_ik = signing_key_pair().unwrap();
        let bob_ik = signing_key_pair().unwrap();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();

        let bundle = PrekeyBundle {
            user_id: "bob".into(),
            ik_pub: URL_SAFE_NO_PAD.encode(&bob_ik.public.0),
            spk_pub: URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&bob_spk_sig),
            opk_pub: None,
            opk_id: None,
        };

        let result = x3dh_snd_side("alice", &alice_ik, &bundle).unwrap();
        let bob_sk = x3dh_rcv_side(&bob_ik, &bob_spk_secret, None, &alice_ik.public, &result.header)
            .unwrap();
        assert_eq!(result.shared_key, bob_sk);
    }
}
