//! Inbound relay events — the `(server, version, sessionId, recipientId,
//! brokerMsg)` stream pushed by C3 (§4.3).

use agent_proto::ServerRef;

#[derive(Debug, Clone)]
pub enum BrokerMsg {
    Msg { server_msg_id: String, body: Vec<u8> },
    /// The server connection reset; any subscription bound to the previous
    /// `sessionId` is now stale (§4.3, §4.7 `END` handling).
    End,
}

#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub server: ServerRef,
    pub agent_version: u16,
    pub session_id: String,
    pub recipient_id: String,
    pub broker_msg: BrokerMsg,
}
