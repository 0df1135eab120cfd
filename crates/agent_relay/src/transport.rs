//! `RelayTransport` — the integration seam for the actual SMP wire protocol
//! (TCP/TLS framing), explicitly out of scope (§1 Out of scope). Only an
//! in-memory simulated transport is provided here, for tests and as a
//! reference implementation a real transport can be swapped in for.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};

use agent_proto::ServerRef;

use crate::error::RelayError;
use crate::events::BrokerMsg;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn create_queue(&self, server: &ServerRef) -> Result<(String, String, String), RelayError>;
    async fn secure_queue(&self, server: &ServerRef, recipient_id: &str, sender_key: &str) -> Result<(), RelayError>;
    async fn send(&self, server: &ServerRef, sender_id: &str, body: Vec<u8>) -> Result<(), RelayError>;
    async fn ack(&self, server: &ServerRef, recipient_id: &str, server_msg_id: &str) -> Result<(), RelayError>;
    async fn suspend_queue(&self, server: &ServerRef, recipient_id: &str) -> Result<u32, RelayError>;
    async fn delete_queue(&self, server: &ServerRef, recipient_id: &str) -> Result<(), RelayError>;
    async fn subscribe(&self, server: &ServerRef, recipient_id: &str) -> Result<(), RelayError>;
    /// Current session id for a server connection; changes on transport reset.
    async fn session_id(&self, server: &ServerRef) -> Result<String, RelayError>;
}

struct SimulatedQueue {
    sender_id: String,
    inbox: Vec<Vec<u8>>,
}

/// Deterministic in-process transport: messages sent to a queue's
/// `sender_id` are appended to that queue's inbox and surfaced through
/// [`crate::pool::RelayPool::poll_inbound`] by the pool, not by this
/// transport directly — this type only tracks queue existence and session
/// identity, mirroring what a real SMP client session would track.
#[derive(Default)]
pub struct SimulatedTransport {
    sessions: Mutex<HashMap<ServerRef, String>>,
    queues: Mutex<HashMap<String, SimulatedQueue>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<(ServerRef, String, String, BrokerMsg)>>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach_inbound(&self, tx: mpsc::UnboundedSender<(ServerRef, String, String, BrokerMsg)>) {
        *self.inbound_tx.lock().await = Some(tx);
    }

    /// Test/demo hook: deliver a message to `recipient_id` as if the peer
    /// had sent it through the relay.
    pub async fn deliver(&self, server: &ServerRef, recipient_id: &str, body: Vec<u8>) -> Result<(), RelayError> {
        let session = self.session_id(server).await?;
        if let Some(tx) = self.inbound_tx.lock().await.as_ref() {
            let msg_id = uuid::Uuid::new_v4().to_string();
            let _ = tx.send((server.clone(), session, recipient_id.to_string(), BrokerMsg::Msg { server_msg_id: msg_id, body }));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for SimulatedTransport {
    async fn create_queue(&self, server: &ServerRef) -> Result<(String, String, String), RelayError> {
        self.sessions.lock().await.entry(server.clone()).or_insert_with(|| uuid::Uuid::new_v4().to_string());
        let recipient_id = uuid::Uuid::new_v4().to_string();
        let sender_id = uuid::Uuid::new_v4().to_string();
        let queue_uri = format!("smp://{server}/{sender_id}");
        self.queues.lock().await.insert(
            recipient_id.clone(),
            SimulatedQueue { sender_id: sender_id.clone(), inbox: Vec::new() },
        );
        Ok((recipient_id, sender_id, queue_uri))
    }

    async fn secure_queue(&self, _server: &ServerRef, recipient_id: &str, _sender_key: &str) -> Result<(), RelayError> {
        if !self.queues.lock().await.contains_key(recipient_id) {
            return Err(RelayError::QueueNotFound(recipient_id.to_string()));
        }
        Ok(())
    }

    async fn send(&self, _server: &ServerRef, sender_id: &str, body: Vec<u8>) -> Result<(), RelayError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .values_mut()
            .find(|q| q.sender_id == sender_id)
            .ok_or_else(|| RelayError::QueueNotFound(sender_id.to_string()))?;
        queue.inbox.push(body);
        Ok(())
    }

    async fn ack(&self, _server: &ServerRef, _recipient_id: &str, _server_msg_id: &str) -> Result<(), RelayError> {
        Ok(())
    }

    async fn suspend_queue(&self, _server: &ServerRef, recipient_id: &str) -> Result<u32, RelayError> {
        let queues = self.queues.lock().await;
        let remaining = queues.get(recipient_id).map(|q| q.inbox.len() as u32).unwrap_or(0);
        Ok(remaining)
    }

    async fn delete_queue(&self, _server: &ServerRef, recipient_id: &str) -> Result<(), RelayError> {
        self.queues.lock().await.remove(recipient_id);
        Ok(())
    }

    async fn subscribe(&self, _server: &ServerRef, recipient_id: &str) -> Result<(), RelayError> {
        if !self.queues.lock().await.contains_key(recipient_id) {
            return Err(RelayError::QueueNotFound(recipient_id.to_string()));
        }
        Ok(())
    }

    async fn session_id(&self, server: &ServerRef) -> Result<String, RelayError> {
        Ok(self
            .sessions
            .lock()
            .await
            .entry(server.clone())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone())
    }
}
