//! Application-facing API types and event stream (§6).

use serde::{Deserialize, Serialize};

use agent_proto::{ConfirmationId, ConnId, CorrId, InternalId, InvitationId};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgIntegrity {
    Ok,
    BadId,
    Duplicate,
    Skipped { lo: InternalId, hi: InternalId },
    BadHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgMeta {
    pub internal_id: InternalId,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub integrity: MsgIntegrity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchPhase {
    Started,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub rcv_queues: usize,
    pub snd_queues: usize,
}

/// Tagged events delivered to a single bounded channel (§6), always paired
/// with the `(corrId, connId)` that originated them.
#[derive(Debug)]
pub enum AgentEvent {
    /// New incoming contact/invitation request.
    Inv { invitation_id: InvitationId },
    /// Staged confirmation awaiting `allowConnection`.
    Conf { conf_id: ConfirmationId, servers: Vec<agent_proto::ServerRef>, info: Vec<u8> },
    /// Peer connection info, surfaced without requiring action.
    Info { info: Vec<u8> },
    /// Contact request received on a `Contact` Rq.
    Req { invitation_id: InvitationId },
    /// Both sides have completed the handshake.
    Con,
    /// The relay session backing this connection's subscription reset.
    End,
    Msg { meta: MsgMeta, flags: i64, body: Vec<u8> },
    Sent { internal_id: InternalId },
    Stat { stats: ConnectionStats },
    Ok,
    Switch { phase: SwitchPhase, stats: ConnectionStats },
    Err { err: AgentError },
    Merr { internal_id: InternalId, err: AgentError },
}

#[derive(Debug)]
pub struct AppEvent {
    pub corr_id: CorrId,
    pub conn_id: Option<ConnId>,
    pub event: AgentEvent,
}
