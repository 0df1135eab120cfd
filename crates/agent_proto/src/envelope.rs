//! The SMP client envelope (§6) — what the agent sends/receives inside the
//! SMP relay's message body, after the relay's own transport framing has
//! already been stripped by the (out-of-scope) SMP relay client.
//!
//! Three tags only. `AgentConfirmation` and `AgentInvitation` are opened
//! with a one-time DH box ([`agent_crypto::cb`]); `AgentMsgEnvelope` wraps
//! a ratchet-protected [`crate::agent_message::AgentMessage`].

use serde::{Deserialize, Serialize};

use agent_crypto::x3dh::X3DHHeader;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEnvelope {
    /// First message from responder to initiator on a `New` Rq (§4.5 Allow).
    AgentConfirmation {
        agent_version: u16,
        /// Present only when the reply carries a fresh X3DH handshake
        /// (duplex-handshake v2); legacy handshakes omit it and rely on a
        /// later `REPLY` inner message instead.
        e2e_encryption: Option<X3DHHeader>,
        /// Box-encrypted `AgentConnInfo` (wire bytes, base64).
        enc_conn_info: String,
    },
    /// Sent to a `Contact` Rq (long-lived address queue).
    AgentInvitation {
        /// Opaque connection-request URI embedding queue + E2E params.
        conn_req: String,
        /// Box-encrypted `AgentConnInfoReply` (wire bytes, base64).
        conn_info: String,
    },
    /// Any ratchet-protected message on an established queue.
    AgentMsgEnvelope {
        agent_version: u16,
        /// Ratchet header + AEAD ciphertext, base64.
        enc_agent_message: String,
        ratchet_header: agent_crypto::ratchet::RatchetHeader,
    },
}

/// Payload of `AgentConfirmation` once box-decrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConnInfo {
    pub sender_verify_key: String,
    pub sender_e2e_pub_key: String,
    /// Reply queues offered by the responder (legacy handshake only).
    pub smp_reply_queues: Vec<String>,
    pub conn_info: String,
}

/// Payload of `AgentInvitation`'s `conn_info` field once box-decrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConnInfoReply {
    pub smp_reply_queues: Vec<String>,
    pub conn_info: String,
}
