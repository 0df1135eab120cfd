//! agent_core — the SMP messaging agent's application-facing surface:
//! Connection Manager (C5), Send Pipeline (C6), Receive Dispatcher (C7),
//! and Operation Gate (C8), wired together behind one [`Agent`] handle.
//!
//! # Module layout
//! - `error`           — unified `AgentError` taxonomy (§6, §7)
//! - `api`             — event/stat types delivered to the app (§6)
//! - `crypto_mediator` — thin seam over `agent_crypto` so C5/C6/C7 never
//!   touch raw key material directly
//! - `context`         — `AgentContext`, the shared handle bundle
//! - `op_gate`         — C8, suspend/resume with per-class drain
//! - `conn_manager`    — C5, the public connection API
//! - `send_pipeline`   — C6, persistent outbox workers
//! - `recv_dispatcher` — C7, inbound event routing

pub mod api;
pub mod conn_manager;
pub mod context;
pub mod crypto_mediator;
pub mod error;
pub mod op_gate;
pub mod recv_dispatcher;
pub mod send_pipeline;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use agent_ntf::NtfSupervisor;
use agent_proto::{AgentConfig, NetworkConfig};
use agent_relay::{InboundEvent, RelayPool};
use agent_store::Store;

pub use api::{AgentEvent, AppEvent, ConnectionStats, MsgIntegrity, MsgMeta, SwitchPhase};
pub use conn_manager::{ConnectionManager, NewConnection};
pub use context::AgentContext;
pub use error::AgentError;
pub use op_gate::{GateState, OpClass, OperationGate};
pub use recv_dispatcher::ReceiveDispatcher;
pub use send_pipeline::SendPipeline;

/// Owns every long-running task and hands out the one [`ConnectionManager`]
/// handle the application drives. Construction order mirrors the
/// dependency chain: context first, then the send pipeline (C6, which the
/// connection manager's control-message path needs), then the connection
/// manager itself, then the receive dispatcher (C7, which needs the
/// connection manager for rotation routing).
pub struct Agent {
    pub conn_mgr: Arc<ConnectionManager>,
    _send_pipeline: Arc<SendPipeline>,
    _recv_dispatcher: Arc<ReceiveDispatcher>,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Builds the agent and spawns its one Receive Dispatcher loop (§5:
    /// "one Receive Dispatcher loop consuming the merged inbound channel").
    /// `inbound` is the receiver half returned alongside the `RelayPool`
    /// the caller constructed (e.g. [`RelayPool::simulated`]); one relay
    /// inbound task per server connection is the transport's job to spawn,
    /// feeding into the same sender the pool was built with.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        relay: Arc<RelayPool>,
        ntf: Arc<NtfSupervisor>,
        network_config: NetworkConfig,
        agent_config: AgentConfig,
        events: mpsc::UnboundedSender<AppEvent>,
        inbound: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = AgentContext::new(store, relay, ntf, network_config, agent_config, events);
        let gate = Arc::new(OperationGate::new());

        let send_pipeline = Arc::new(SendPipeline::new(ctx.clone(), gate.clone(), shutdown_rx));
        let conn_mgr = Arc::new(ConnectionManager::new(ctx.clone(), gate.clone(), send_pipeline.clone()));
        let recv_dispatcher = Arc::new(ReceiveDispatcher::new(ctx, conn_mgr.clone()));

        let dispatcher = recv_dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.run(inbound).await;
        });

        Self { conn_mgr, _send_pipeline: send_pipeline, _recv_dispatcher: recv_dispatcher, shutdown_tx }
    }

    /// `suspendAgent(maxDelay)` (§4.8).
    pub async fn suspend(&self, max_delay: std::time::Duration) {
        self.conn_mgr.suspend_agent(max_delay).await;
    }

    pub async fn activate(&self) {
        self.conn_mgr.activate_agent().await;
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
