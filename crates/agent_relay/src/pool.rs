//! `RelayPool` — per-server client cache plus the merged inbound event
//! stream (§4.3). One [`RelayTransport`] handle is kept per [`ServerRef`];
//! the handle is cheap to clone since SMP client sessions multiplex many
//! queues over one connection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

use agent_proto::ServerRef;

use crate::error::RelayError;
use crate::events::{BrokerMsg, InboundEvent};
use crate::transport::{RelayTransport, SimulatedTransport};

pub struct RelayPool {
    clients: RwLock<HashMap<ServerRef, Arc<dyn RelayTransport>>>,
    factory: Arc<dyn Fn() -> Arc<dyn RelayTransport> + Send + Sync>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
}

pub struct SubscribeOutcome {
    pub recipient_id: String,
    pub result: Result<(), RelayError>,
}

impl RelayPool {
    /// Build a pool over an in-memory simulated transport, useful for
    /// tests and as the default until a real SMP transport is wired in.
    pub fn simulated() -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        Self::new(|| Arc::new(SimulatedTransport::new()) as Arc<dyn RelayTransport>)
    }

    pub fn new<F>(factory: F) -> (Self, mpsc::UnboundedReceiver<InboundEvent>)
    where
        F: Fn() -> Arc<dyn RelayTransport> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { clients: RwLock::new(HashMap::new()), factory: Arc::new(factory), inbound_tx: tx },
            rx,
        )
    }

    fn client_for(&self, server: &ServerRef) -> Arc<dyn RelayTransport> {
        if let Some(c) = self.clients.read().get(server) {
            return c.clone();
        }
        let client = (self.factory)();
        self.clients.write().insert(server.clone(), client.clone());
        info!(server = %server, "relay client created");
        client
    }

    pub async fn create_rcv_queue(&self, server: &ServerRef) -> Result<(String, String, String), RelayError> {
        self.client_for(server).create_queue(server).await
    }

    pub async fn secure_queue(&self, server: &ServerRef, recipient_id: &str, sender_key: &str) -> Result<(), RelayError> {
        self.client_for(server).secure_queue(server, recipient_id, sender_key).await
    }

    pub async fn send_ack(&self, server: &ServerRef, recipient_id: &str, server_msg_id: &str) -> Result<(), RelayError> {
        self.client_for(server).ack(server, recipient_id, server_msg_id).await
    }

    /// Returns the count of messages still queued at the relay for the
    /// suspended Rq.
    pub async fn suspend_queue(&self, server: &ServerRef, recipient_id: &str) -> Result<u32, RelayError> {
        self.client_for(server).suspend_queue(server, recipient_id).await
    }

    pub async fn delete_queue(&self, server: &ServerRef, recipient_id: &str) -> Result<(), RelayError> {
        self.client_for(server).delete_queue(server, recipient_id).await
    }

    pub async fn subscribe_queue(&self, server: &ServerRef, recipient_id: &str) -> Result<(), RelayError> {
        self.client_for(server).subscribe(server, recipient_id).await
    }

    /// `subscribeQueues` (§4.3): per-queue result, one entry per input —
    /// a size mismatch at the call site is an internal-error condition
    /// (§5 ordering guarantees).
    pub async fn subscribe_queues(&self, server: &ServerRef, recipient_ids: &[String]) -> Vec<SubscribeOutcome> {
        let client = self.client_for(server);
        let mut out = Vec::with_capacity(recipient_ids.len());
        for recipient_id in recipient_ids {
            let result = client.subscribe(server, recipient_id).await;
            out.push(SubscribeOutcome { recipient_id: recipient_id.clone(), result });
        }
        out
    }

    pub async fn send_confirmation(&self, server: &ServerRef, sender_id: &str, body: Vec<u8>) -> Result<(), RelayError> {
        self.client_for(server).send(server, sender_id, body).await
    }

    pub async fn send_agent_message(&self, server: &ServerRef, sender_id: &str, body: Vec<u8>) -> Result<(), RelayError> {
        self.client_for(server).send(server, sender_id, body).await
    }

    pub async fn send_invitation(&self, server: &ServerRef, sender_id: &str, body: Vec<u8>) -> Result<(), RelayError> {
        self.client_for(server).send(server, sender_id, body).await
    }

    pub async fn session_id(&self, server: &ServerRef) -> Result<String, RelayError> {
        self.client_for(server).session_id(server).await
    }

    /// Forward a simulated-transport delivery onto the merged inbound
    /// stream. Real transports push their own `MSG`/`END` frames directly;
    /// this helper exists so tests can drive the pool without a live relay.
    pub fn emit_test_event(&self, event: InboundEvent) {
        if self.inbound_tx.send(event).is_err() {
            warn!("inbound event dropped: receiver closed");
        }
    }

    /// Notify the inbound stream that a server connection reset, so C7 can
    /// invalidate subscriptions bound to the stale `sessionId` (§4.3).
    pub fn emit_end(&self, server: ServerRef, session_id: String) {
        self.emit_test_event(InboundEvent {
            server,
            agent_version: 0,
            session_id,
            recipient_id: String::new(),
            broker_msg: BrokerMsg::End,
        });
    }
}
