//! Inner agent message (§6) — the plaintext sealed inside a ratchet step
//! (or, for the very first envelope, inside the confirmation box).
//!
//! `priv_header` is itself part of the ratchet plaintext so that the
//! `prevMsgHash` chain survives even across queue rotation, where the AEAD
//! header alone would reset.

use serde::{Deserialize, Serialize};

/// Carried in every `AgentMessage`, independent of `payload`'s kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivHeader {
    /// Sender-local strictly increasing sequence number for this queue.
    pub snd_msg_id: u64,
    /// BLAKE3 of the previous `AgentMessage` sent on this queue, hex.
    /// `None` only for the very first message.
    pub prev_msg_hash: Option<String>,
}

/// The `smpQueueInfo` / `nextQueueInfo` payload shape referenced by `QNEW`,
/// `QKEYS`, `QREADY`, `QSWITCH` — an opaque queue URI plus the sender key
/// the recipient will use once the rotation completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmpQueueInfo {
    pub queue_uri: String,
    pub sender_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMsgPayload {
    /// Confirm queue use.
    Hello,
    /// Send reply queues (legacy handshake only).
    Reply { smp_queues: Vec<SmpQueueInfo> },
    /// Application payload.
    AMsg { body: Vec<u8> },
    /// Announce rotation target.
    QNew { current_addr: String, next_queue_uri: String },
    /// Provide keys for the recipient to secure the next Rq.
    QKeys { next_sender_key: String, next_queue_info: SmpQueueInfo },
    /// Next Rq is secured.
    QReady { addr: String },
    /// Sender pings next Sq.
    QTest,
    /// Recipient acks swap on new Rq.
    QSwitch { addr: String },
    /// Sender acks on new Sq; triggers delete of old Rq.
    QHello,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub priv_header: PrivHeader,
    pub payload: AgentMsgPayload,
}

impl AgentMessage {
    pub fn no_msg_flags(&self) -> bool {
        !matches!(self.payload, AgentMsgPayload::AMsg { .. })
    }
}
