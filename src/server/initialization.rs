// src/server/initialization.rs

//! Handles the complete server initialization process: building every
//! component wired into `FleetState` from a loaded configuration.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

use super::context::{FleetState, ServerContext};
use crate::config::{Config, ConfigHandle};
use crate::core::control::ControlPlane;
use crate::core::events::EventBus;
use crate::core::master::MasterClient;
use crate::core::proxy::ProxyRunner;
use crate::core::registry::InstanceRegistry;
use crate::core::restart_policy::RestartPolicy;
use crate::core::scaling::{ScalingEngine, ScalingLimits};
use crate::core::supervisor::ProcessSupervisor;
use crate::core::capacity;

/// Initializes every core component before the background tasks are spawned.
pub async fn setup(
    config: Config,
    config_path: impl Into<std::path::PathBuf>,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let config_handle = ConfigHandle::new(config_path, config.clone());
    let registry = Arc::new(InstanceRegistry::new());
    let events = Arc::new(EventBus::new());
    let control = ControlPlane::new(registry.clone(), events.clone());
    let supervisor = ProcessSupervisor::new(registry.clone(), control.clone(), events.clone(), config_handle.clone());
    let master = MasterClient::new(config_handle.clone(), events.clone());
    let proxy = Arc::new(ProxyRunner::new(registry.clone(), config_handle.clone()));
    let restart_policy = RestartPolicy::new(registry.clone(), supervisor.clone(), config_handle.clone());

    let state = Arc::new(FleetState {
        config: config_handle,
        registry,
        events,
        control,
        supervisor,
        master,
        proxy,
        restart_policy,
        log_reload_handle,
    });

    if config.features.auto_start_on_launch {
        seed_initial_fleet(&state).await;
    }

    info!(
        "fleet manager initialized: host='{}' manager_port={}",
        config.host.name, config.host.manager_port
    );

    Ok(ServerContext {
        state,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Brings the fleet up to `auto_scaling.min` instances on launch, when
/// configured (§4.1 feature toggles).
async fn seed_initial_fleet(state: &Arc<FleetState>) {
    let config = state.config.current();
    let target = config.features.auto_scaling.min;
    if target == 0 {
        return;
    }
    let cpu_count = capacity::detect_cpu_count();
    let limits = ScalingLimits {
        configured_total: config.features.auto_scaling.max,
        cpu_count,
        per_core_factor: config.features.per_core_server_factor,
        min_idle_ready: config.features.auto_scaling.min_idle_ready,
        min_total: config.features.auto_scaling.min,
    };
    let engine = ScalingEngine::new(state.clone());
    if let Err(e) = engine.scale_to(target, &limits).await {
        warn!("failed to seed initial fleet to {target} instances on launch: {e}");
    }
}

fn log_startup_info(config: &Config) {
    info!(
        "host '{}' ({}) starting with base_game_port={} base_voice_port={} manager_port={}",
        config.host.name, config.host.location, config.host.base_game_port, config.host.base_voice_port, config.host.manager_port
    );
    if config.features.auto_scaling.enabled {
        info!(
            "auto-scaling enabled: min={} max={} min_idle_ready={}",
            config.features.auto_scaling.min, config.features.auto_scaling.max, config.features.auto_scaling.min_idle_ready
        );
    }
    if config.features.proxy_enabled {
        info!("proxy fleet enabled, binary={}", config.proxy.binary_path.display());
    }
}
