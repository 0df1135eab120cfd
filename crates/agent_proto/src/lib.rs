//! agent_proto — wire envelopes, inner agent messages, codec, and shared
//! config/ids for the SMP messaging agent.
//!
//! # Module layout
//! - `ids`            — opaque identifiers (`ConnId`, `ServerRef`, ...)
//! - `envelope`        — outer SMP client envelope (confirmation/invitation/msg)
//! - `agent_message`   — inner ratchet-protected `AgentMessage` + payload kinds
//! - `codec`           — fixed-length padding for the two padded plaintexts
//! - `config`          — `NetworkConfig`/`AgentConfig`
//! - `error`           — unified error type

pub mod agent_message;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ids;

pub use agent_message::{AgentMessage, AgentMsgPayload, PrivHeader, SmpQueueInfo};
pub use codec::PaddedKind;
pub use config::{AgentConfig, NetworkConfig, VersionRange};
pub use envelope::{AgentConnInfo, AgentConnInfoReply, ClientEnvelope};
pub use error::ProtoError;
pub use ids::{ConfirmationId, ConnId, CorrId, InternalId, InvitationId, ServerRef};
