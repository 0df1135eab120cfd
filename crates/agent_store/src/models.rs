//! Database row models — these map to/from SQL rows (§3 Data Model).
//!
//! Columns holding key material or ratchet state are vault-encrypted
//! (base64 ciphertext) by the caller before insert; `Store` never touches
//! plaintext key material directly, only opaque encrypted blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConnectionRow {
    pub conn_id: String,
    /// `rcv` | `snd` | `duplex` | `contact`.
    pub variant: String,
    pub conn_agent_version: i64,
    pub enable_ntfs: bool,
    /// NULL = unset, 0 = false, 1 = true (§3 tri-state `duplexHandshake`).
    pub duplex_handshake: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RcvQueueRow {
    pub id: String,
    pub conn_id: String,
    pub server_host: String,
    pub server_port: i64,
    pub server_fingerprint: String,
    /// Private recipient id — never sent to the peer.
    pub recipient_id: String,
    /// Public sender id, handed to the peer so they can address us.
    pub sender_id: String,
    /// Vault-encrypted `DeviceKeyPair` (Ed25519 recipient signing key).
    pub recipient_signing_key_enc: String,
    /// Vault-encrypted X25519 static secret.
    pub e2e_dh_priv_enc: String,
    pub sender_public_verify_key: Option<String>,
    /// Vault-encrypted derived e2e DH secret, once the peer's key arrives.
    pub e2e_dh_secret_enc: Option<String>,
    pub smp_client_version: i64,
    /// `new` | `confirmed` | `secured` | `active` | `disabled`.
    pub status: String,
    pub current_flag: bool,
    /// `create_next` | `secure_next` | `suspend_current` | `delete_current`.
    pub rotation_action: Option<String>,
    pub rotation_action_ts: Option<DateTime<Utc>>,
    /// Link to the paired next-queue row during rotation.
    pub next_rcv_queue_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SndQueueRow {
    pub id: String,
    pub conn_id: String,
    pub server_host: String,
    pub server_port: i64,
    pub server_fingerprint: String,
    pub sender_id: String,
    /// Vault-encrypted Ed25519 send signing key pair.
    pub send_signing_key_enc: String,
    /// Vault-encrypted X25519 shared secret established via X3DH.
    pub e2e_dh_shared_secret_enc: String,
    pub e2e_dh_public_key: String,
    /// `new` | `confirmed` | `active` | `disabled`.
    pub status: String,
    pub current_flag: bool,
    pub next_snd_queue_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxMessageRow {
    /// Per-connection strictly increasing id, assigned under the same
    /// transaction as `hash` computation (§3 invariants).
    pub internal_id: i64,
    pub conn_id: String,
    /// External per-queue sequence number (`externalSndId`), increments by
    /// one per sent `a-msg` only.
    pub internal_snd_id: i64,
    pub ts: DateTime<Utc>,
    /// `conn-info` | `hello` | `reply` | `a-msg` | `q-new` | `q-keys` |
    /// `q-ready` | `q-test` | `q-switch` | `q-hello`.
    pub kind: String,
    pub flags: i64,
    pub body_enc: String,
    pub hash: String,
    pub prev_hash: Option<String>,
    /// Pins delivery to one `senderId` rather than whichever Sq is
    /// `current` (§4.5 `q-test`/`q-hello`, sent on the not-yet-swapped-in
    /// next Sq).
    pub target_sender_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RatchetRow {
    pub conn_id: String,
    /// Vault-encrypted, serialized `RatchetSession`.
    pub state_enc: String,
    pub updated_at: DateTime<Utc>,
}


/// Receive-side tracking for `MsgIntegrity` checks (§4.7) and idempotent
/// `A_DUPLICATE` redelivery — one row per connection, overwritten on every
/// successfully decrypted `a-msg`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RcvTrackingRow {
    pub conn_id: String,
    pub last_ext_snd_id: i64,
    pub last_rcv_hash: Option<String>,
    pub last_internal_id: i64,
    pub last_body_enc: Option<String>,
    pub last_acked: bool,
    /// Raw SMP server message id for the last delivered `a-msg`, kept so
    /// `ackMessage` can issue the relay ACK after the fact.
    pub last_server_msg_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NtfTokenRow {
    pub id: String,
    pub device_token: String,
    pub ntf_server: String,
    pub tkn_id: Option<String>,
    /// `none` | `registered` | `confirmed` | `active` | `expired`.
    pub status: String,
    pub action: Option<String>,
    /// `instant` | `periodic`.
    pub mode: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfirmationRow {
    pub conf_id: String,
    pub conn_id: String,
    pub sender_verify_key: String,
    pub sender_e2e_pub_key: String,
    /// JSON-encoded `Vec<SmpQueueInfo>`.
    pub smp_reply_queues_json: String,
    pub conn_info: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvitationRow {
    pub invitation_id: String,
    pub conn_req: String,
    pub conn_info: String,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}
