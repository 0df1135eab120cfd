//! agent_crypto — cryptographic primitives for the SMP messaging agent (C2).
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity`   — long-term Ed25519 identity + per-queue signing key pairs
//! - `x3dh`       — X3DH asynchronous key agreement (SPK verification, proper DH)
//! - `ratchet`    — full Double Ratchet with DH ratchet steps + skipped message keys
//! - `cb`         — one-time DH "confirmation box" decrypt for the first envelope on a queue
//! - `aead`       — XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`        — HKDF / Argon2id key derivation
//! - `hash`       — BLAKE3 utilities (message IDs, chain links)
//! - `hash_chain` — tamper-evident local message history chain
//! - `error`      — unified error type

pub mod aead;
pub mod cb;
pub mod error;
pub mod hash;
pub mod hash_chain;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
