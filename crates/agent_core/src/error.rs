//! Unified error taxonomy surfaced to the application (§6, §7).
//!
//! Transient causes (`Broker(Host)`, timeouts, some SMP errors) are
//! retried inside the send pipeline and never constructed here directly —
//! by the time an `AgentError` exists, the retry budget for that cause is
//! already exhausted.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    Version,
    Message,
    Prohibited,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnErrorKind {
    NotAvailable,
    NotAccepted,
    Simplex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    Host,
    Timeout,
    Unexpected,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("AGENT {0:?}")]
    Agent(AgentErrorKind),

    #[error("CONN {0:?}")]
    Conn(ConnErrorKind),

    #[error("CMD PROHIBITED")]
    CmdProhibited,

    #[error("SMP error: {0:?}")]
    Smp(agent_relay::SmpErrorCode),

    #[error("NTF error: {0}")]
    Ntf(#[from] agent_ntf::NtfError),

    #[error("BROKER {0:?}")]
    Broker(BrokerErrorKind),

    #[error("INTERNAL: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(agent_store::StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] agent_crypto::CryptoError),

    #[error("proto error: {0}")]
    Proto(#[from] agent_proto::ProtoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// `NotFound` on a foreign-key lookup is caller mis-use (§7) — the caller
/// referenced a connId/confId/invitationId that no longer (or never did)
/// exist — so it surfaces as `CMD PROHIBITED` rather than an opaque store
/// error; everything else bubbles as `Store`.
impl From<agent_store::StoreError> for AgentError {
    fn from(e: agent_store::StoreError) -> Self {
        match e {
            agent_store::StoreError::NotFound(_) => AgentError::CmdProhibited,
            other => AgentError::Store(other),
        }
    }
}

impl From<agent_relay::RelayError> for AgentError {
    fn from(e: agent_relay::RelayError) -> Self {
        use agent_relay::{BrokerErrorKind as RB, RelayError};
        match e {
            RelayError::Smp(code) => AgentError::Smp(code),
            RelayError::Broker(RB::Host) => AgentError::Broker(BrokerErrorKind::Host),
            RelayError::Broker(RB::Timeout) => AgentError::Broker(BrokerErrorKind::Timeout),
            RelayError::Broker(RB::Unexpected) => AgentError::Broker(BrokerErrorKind::Unexpected),
            other => AgentError::Internal(other.to_string()),
        }
    }
}
