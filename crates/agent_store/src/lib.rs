//! agent_store — persistence gateway (C1) for the SMP messaging agent.
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. We use application-level encryption:
//! - Columns holding key material or ratchet state are stored as
//!   XChaCha20-Poly1305 ciphertext, base64-encoded.
//! - The vault key is derived from the agent's unlock secret via Argon2id
//!   and held in memory only while the vault is unlocked.
//! - Non-sensitive metadata (timestamps, ids, status) is stored in
//!   plaintext to allow efficient queries.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.

pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod types;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
pub use vault::Vault;
