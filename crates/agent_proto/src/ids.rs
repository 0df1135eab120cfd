//! Opaque identifiers shared across the agent (§3 Data Model, §9 Design Notes).
//!
//! Connections and queues reference each other by id, looked up through
//! `agent_store` — never by direct object reference, so there are no
//! cycles in the in-memory graph.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque connection identifier. Stable for the life of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A staged confirmation id, returned to the app as `CONF(confId, ...)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfirmationId(pub String);

impl ConfirmationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// A staged contact-invitation id, returned to the app as `REQ(invId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvitationId(pub String);

impl InvitationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Uniquely names a relay: `(host, port, fingerprint)` — §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerRef {
    pub host: String,
    pub port: u16,
    /// TLS certificate fingerprint, hex-encoded.
    pub fingerprint: String,
}

impl fmt::Display for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, &self.fingerprint[..self.fingerprint.len().min(12)])
    }
}

/// Per-connection, strictly increasing internal message id (§3 invariants).
pub type InternalId = i64;

/// Correlation id attached to every app-visible event (§6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrId(pub String);

impl CorrId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
