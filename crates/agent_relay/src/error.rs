use thiserror::Error;

/// SMP broker-level error codes (§4.3) — a representative subset of the
/// real relay's error vocabulary; enough to drive the send-pipeline's
/// classification table (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpErrorCode {
    Auth,
    Quota,
    NoMsg,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    Host,
    Timeout,
    Unexpected,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("SMP error: {0:?}")]
    Smp(SmpErrorCode),

    #[error("broker error: {0:?}")]
    Broker(BrokerErrorKind),

    #[error("transient network error: {0}")]
    Network(String),

    #[error("crypto error during relay operation: {0}")]
    Crypto(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),
}

impl RelayError {
    /// Whether the send pipeline should retry this error with backoff
    /// rather than surfacing it immediately (§4.6).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Network(_) | RelayError::Broker(BrokerErrorKind::Host) | RelayError::Broker(BrokerErrorKind::Timeout)
        )
    }
}
