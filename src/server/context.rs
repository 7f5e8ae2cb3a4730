// src/server/context.rs

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing_subscriber::{filter::EnvFilter, reload};

use crate::config::ConfigHandle;
use crate::core::control::ControlPlane;
use crate::core::errors::FleetResult;
use crate::core::events::EventBus;
use crate::core::master::MasterClient;
use crate::core::proxy::ProxyRunner;
use crate::core::registry::{Instance, InstanceRegistry};
use crate::core::restart_policy::RestartPolicy;
use crate::core::scaling::FleetProvider;
use crate::core::supervisor::{argv, ProcessSupervisor};

/// The Arc-wrapped central struct holding every live component, handed to
/// every background task (§4.14 `FleetState`).
pub struct FleetState {
    pub config: ConfigHandle,
    pub registry: Arc<InstanceRegistry>,
    pub events: Arc<EventBus>,
    pub control: Arc<ControlPlane>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub master: Arc<MasterClient>,
    pub proxy: Arc<ProxyRunner>,
    pub restart_policy: Arc<RestartPolicy>,
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

/// Lets the scaling engine drive the fleet without knowing about the
/// supervisor/registry split directly (§4.8 provider interface).
#[async_trait]
impl FleetProvider for FleetState {
    fn instances(&self) -> Vec<Instance> {
        self.registry.snapshot()
    }

    /// Registers a new instance with ports derived from its (predicted) id
    /// and the host's base ports (§4.3 argv construction).
    fn add_new_server(&self) -> u32 {
        let config = self.config.current();
        let next_id = self
            .registry
            .snapshot()
            .iter()
            .map(|i| i.id)
            .max()
            .map(|id| id + 1)
            .unwrap_or(1);
        let (game_port, voice_port, _public_port) = argv::derive_ports(&config, next_id);
        self.registry
            .add_new(game_port, voice_port, Some(config.host.manager_port))
    }

    async fn start(&self, id: u32) -> FleetResult<()> {
        self.supervisor.start(id).await
    }

    async fn stop(&self, id: u32, graceful: bool) -> FleetResult<()> {
        self.supervisor.stop(id, graceful).await
    }
}

/// Holds everything the main loop needs beyond `FleetState` itself: the
/// shutdown broadcaster and the set of spawned background tasks, matching
/// this codebase's existing server/{context,initialization,spawner,
/// connection_loop} split.
pub struct ServerContext {
    pub state: Arc<FleetState>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
}
