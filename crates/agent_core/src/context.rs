//! `AgentContext` — every shared handle an operation needs, threaded
//! explicitly instead of read off a global. Mirrors how
//! `guard-service::engine` wires its `Arc<Store>`/`Arc<RelayClient>` handles
//! through `EngineHandle` rather than reaching for statics.

use std::sync::Arc;

use agent_ntf::NtfSupervisor;
use agent_proto::{AgentConfig, NetworkConfig};
use agent_relay::RelayPool;
use agent_store::Store;
use tokio::sync::mpsc;

use crate::api::AppEvent;

/// Bundles the C1/C3/C4 handles plus config that C5/C6/C7 all need.
/// Cheap to clone — everything inside is already an `Arc` or a channel
/// handle.
#[derive(Clone)]
pub struct AgentContext {
    pub store: Arc<Store>,
    pub relay: Arc<RelayPool>,
    pub ntf: Arc<NtfSupervisor>,
    pub network_config: Arc<NetworkConfig>,
    pub agent_config: Arc<AgentConfig>,
    pub events: mpsc::UnboundedSender<AppEvent>,
}

impl AgentContext {
    pub fn new(
        store: Arc<Store>,
        relay: Arc<RelayPool>,
        ntf: Arc<NtfSupervisor>,
        network_config: NetworkConfig,
        agent_config: AgentConfig,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            store,
            relay,
            ntf,
            network_config: Arc::new(network_config),
            agent_config: Arc::new(agent_config),
            events,
        }
    }

    pub fn emit(&self, event: AppEvent) {
        if self.events.send(event).is_err() {
            tracing::warn!("application event dropped: receiver closed");
        }
    }
}
