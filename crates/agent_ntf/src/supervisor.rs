//! `NtfSupervisor` (C4) — mirrors connection lifecycle into notification
//! subscription state (§4.4). Grounded on the same `Arc<Mutex<..>>` +
//! background-loop idiom `guard-service::connected::heartbeat` uses to
//! mirror device state to a remote service.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use agent_proto::ConnId;

use crate::error::NtfError;
use crate::token::{NtfMode, NtfToken, NtfTransition};

#[derive(Debug, Clone)]
pub enum NtfCommand {
    Create { conn_id: ConnId },
    Delete { conn_id: ConnId },
}

/// The notification-relay wire contract (out of scope per §1; this is the
/// integration seam).
#[async_trait]
pub trait NtfRelay: Send + Sync {
    async fn create_subscription(&self, conn_id: &ConnId) -> Result<(), NtfError>;
    async fn delete_subscription(&self, conn_id: &ConnId) -> Result<(), NtfError>;
}

pub struct NoopNtfRelay;

#[async_trait]
impl NtfRelay for NoopNtfRelay {
    async fn create_subscription(&self, _conn_id: &ConnId) -> Result<(), NtfError> {
        Ok(())
    }
    async fn delete_subscription(&self, _conn_id: &ConnId) -> Result<(), NtfError> {
        Ok(())
    }
}

pub struct NtfSupervisor {
    token: Arc<RwLock<NtfToken>>,
    relay: Arc<dyn NtfRelay>,
    queue: Arc<SyncMutex<VecDeque<NtfCommand>>>,
    cmd_tx: mpsc::UnboundedSender<()>,
}

impl NtfSupervisor {
    pub fn new(token: NtfToken, relay: Arc<dyn NtfRelay>, mut shutdown: watch::Receiver<bool>) -> Self {
        let token = Arc::new(RwLock::new(token));
        let queue: Arc<SyncMutex<VecDeque<NtfCommand>>> = Arc::new(SyncMutex::new(VecDeque::new()));
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<()>();

        let loop_token = token.clone();
        let loop_queue = queue.clone();
        let loop_relay = relay.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cmd_rx.recv() => {
                        Self::drain_queue(&loop_token, &loop_queue, loop_relay.as_ref()).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
            }
        });

        Self { token, relay, queue, cmd_tx }
    }

    async fn drain_queue(token: &Arc<RwLock<NtfToken>>, queue: &Arc<SyncMutex<VecDeque<NtfCommand>>>, relay: &dyn NtfRelay) {
        let is_active_instant = {
            let t = token.read().await;
            t.state == crate::token::NtfTokenState::Active && matches!(t.mode, NtfMode::Instant)
        };
        if !is_active_instant {
            return;
        }
        loop {
            let next = queue.lock().pop_front();
            let Some(cmd) = next else { break };
            let result = match &cmd {
                NtfCommand::Create { conn_id } => relay.create_subscription(conn_id).await,
                NtfCommand::Delete { conn_id } => relay.delete_subscription(conn_id).await,
            };
            if let Err(err) = result {
                warn!(?cmd, %err, "notification relay command failed");
            } else {
                info!(?cmd, "notification subscription command applied");
            }
        }
    }

    fn kick(&self) {
        let _ = self.cmd_tx.send(());
    }

    /// Mirrors a new subscribed connection into a `create` command.
    pub fn on_connection_subscribed(&self, conn_id: ConnId) {
        self.queue.lock().push_back(NtfCommand::Create { conn_id });
        self.kick();
    }

    /// `delete` is broadcast via flush-then-enqueue (§4.4): any pending
    /// command for the same connection is cancelled first so the delete
    /// is the only thing the relay ever sees for it.
    pub fn on_connection_deleted(&self, conn_id: ConnId) {
        {
            let mut q = self.queue.lock();
            q.retain(|cmd| !matches!(cmd, NtfCommand::Create { conn_id: c } if *c == conn_id));
            q.push_back(NtfCommand::Delete { conn_id });
        }
        self.kick();
    }

    pub async fn register(&self) -> Result<(), NtfError> {
        self.token.write().await.transition(NtfTransition::Register)
    }

    pub async fn verify(&self, tkn_id: String) -> Result<(), NtfError> {
        let mut t = self.token.write().await;
        t.tkn_id = Some(tkn_id);
        t.transition(NtfTransition::Verify)
    }

    pub async fn check(&self) -> Result<(), NtfError> {
        self.token.write().await.transition(NtfTransition::Check)
    }

    pub async fn replace(&self, tkn_id: String) -> Result<(), NtfError> {
        let mut t = self.token.write().await;
        t.tkn_id = Some(tkn_id);
        t.transition(NtfTransition::Replace)
    }

    pub async fn delete_token(&self) -> Result<(), NtfError> {
        self.token.write().await.transition(NtfTransition::Delete)
    }

    pub async fn state(&self) -> crate::token::NtfTokenState {
        self.token.read().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    struct CountingRelay {
        creates: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl NtfRelay for CountingRelay {
        async fn create_subscription(&self, _conn_id: &ConnId) -> Result<(), NtfError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn delete_subscription(&self, _conn_id: &ConnId) -> Result<(), NtfError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delete_cancels_pending_create_for_same_connection() {
        let (_tx, rx) = watch::channel(false);
        let relay = Arc::new(CountingRelay { creates: AtomicUsize::new(0), deletes: AtomicUsize::new(0) });
        let mut token = NtfToken::new("t1", "dev", "ntf.example", NtfMode::Instant);
        token.state = crate::token::NtfTokenState::Active;
        let supervisor = NtfSupervisor::new(token, relay.clone(), rx);

        let conn_id = ConnId::generate();
        supervisor.on_connection_subscribed(conn_id.clone());
        supervisor.on_connection_deleted(conn_id);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(relay.creates.load(Ordering::SeqCst), 0);
        assert_eq!(relay.deletes.load(Ordering::SeqCst), 1);
    }
}
