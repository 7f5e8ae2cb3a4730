// src/core/supervisor/mod.rs

//! The process supervisor (C3): starts, stops, and restarts instance child
//! processes, enforcing the Offline -> Starting -> Ready -> Occupied ->
//! (Draining) -> Stopping -> Offline/Crashed state machine and bounding the
//! number of simultaneously-launching children (P3).

pub mod argv;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::core::control::{ControlPlane, OutboundFrame};
use crate::core::errors::{FleetError, FleetResult};
use crate::core::events::{EventBus, FleetEvent};
use crate::core::metrics;
use crate::core::registry::{InstanceRegistry, InstanceStatus};

/// How long a freshly-spawned child has to announce itself (`0x40`) before
/// the launch is declared failed (§4.3 failure modes).
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a graceful stop waits for the child to exit after `0x22` before
/// escalating to a hard kill (§4.3, §4.9 `max_wait_for_game` is a distinct,
/// longer deadline used by the restart policy).
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(15);
const GRACEFUL_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Stagger between successive launches in a bulk `start_all`, so N instances
/// don't all bind ports and touch disk in the same tick.
const BULK_START_STAGGER: Duration = Duration::from_millis(250);

enum WaitOutcome {
    Ready,
    ExitedEarly(std::io::Result<std::process::ExitStatus>),
    TimedOut,
}

/// Owns the live child handles and mediates every state transition driven by
/// process lifecycle (as opposed to the ones driven by status frames, which
/// `core::control::listener` applies directly to the registry).
pub struct ProcessSupervisor {
    registry: Arc<InstanceRegistry>,
    control: Arc<ControlPlane>,
    events: Arc<EventBus>,
    config: ConfigHandle,
    children: DashMap<u32, Arc<AsyncMutex<Child>>>,
    start_semaphore: Arc<Semaphore>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        control: Arc<ControlPlane>,
        events: Arc<EventBus>,
        config: ConfigHandle,
    ) -> Arc<Self> {
        let max_start_at_once = config.current().max_start_at_once;
        Arc::new(Self {
            registry,
            control,
            events,
            config,
            children: DashMap::new(),
            start_semaphore: Arc::new(Semaphore::new(max_start_at_once)),
        })
    }

    /// Launches the instance's child process, blocking on the start-slot
    /// semaphore until one is free (P3), and waits up to [`ANNOUNCE_TIMEOUT`]
    /// for the child to announce itself over the control channel before
    /// declaring the launch failed.
    pub async fn start(self: &Arc<Self>, id: u32) -> FleetResult<()> {
        let instance = self
            .registry
            .get(id)
            .ok_or(FleetError::UnknownInstance(id))?;
        if !matches!(
            instance.status,
            InstanceStatus::Offline | InstanceStatus::Crashed
        ) {
            return Err(FleetError::Scaling(format!(
                "instance {id} cannot start from status {}",
                instance.status
            )));
        }

        let permit = self
            .start_semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("start semaphore never closes");

        self.registry.mutate(id, |i| i.status = InstanceStatus::Starting);

        let config = self.config.current();
        let plan = argv::build(&config, &instance);
        let mut command = tokio::process::Command::new(&plan.program);
        command.args(&plan.args).envs(&plan.envs).current_dir(&plan.cwd);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                drop(permit);
                self.registry.mutate(id, |i| {
                    i.status = InstanceStatus::Crashed;
                    i.pid = None;
                });
                return Err(FleetError::LaunchFailed(format!(
                    "failed to spawn '{}': {e}",
                    plan.program.display()
                )));
            }
        };
        let pid = child.id();
        self.registry.mutate(id, |i| {
            i.pid = pid;
            i.start_time = Some(Instant::now());
        });
        metrics::PROCESS_SPAWNS_TOTAL.inc();
        info!("instance {id}: spawned pid={pid:?}");

        let mut ready_rx = self.events.subscribe();
        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::ExitedEarly(status),
            _ = wait_for_ready(&mut ready_rx, id) => WaitOutcome::Ready,
            _ = tokio::time::sleep(ANNOUNCE_TIMEOUT) => WaitOutcome::TimedOut,
        };

        match outcome {
            WaitOutcome::Ready => {
                self.children.insert(id, Arc::new(AsyncMutex::new(child)));
                self.spawn_watcher(id);
                drop(permit);
                Ok(())
            }
            WaitOutcome::ExitedEarly(status) => {
                drop(permit);
                self.registry.mutate(id, |i| {
                    i.status = InstanceStatus::Crashed;
                    i.pid = None;
                });
                self.events.publish(FleetEvent::ServerOffline { instance_id: id });
                Err(FleetError::LaunchFailed(format!(
                    "instance {id} exited before announcing: {status:?}"
                )))
            }
            WaitOutcome::TimedOut => {
                drop(permit);
                let _ = child.start_kill();
                self.registry.mutate(id, |i| {
                    i.status = InstanceStatus::Crashed;
                    i.pid = None;
                });
                self.events.publish(FleetEvent::ServerOffline { instance_id: id });
                Err(FleetError::AnnounceTimeout)
            }
        }
    }

    /// Stops an instance. `graceful` sends `0x22` and waits up to
    /// [`GRACEFUL_STOP_TIMEOUT`] before escalating to a hard kill; a
    /// non-graceful stop kills immediately.
    pub async fn stop(self: &Arc<Self>, id: u32, graceful: bool) -> FleetResult<()> {
        let instance = self
            .registry
            .get(id)
            .ok_or(FleetError::UnknownInstance(id))?;
        if matches!(
            instance.status,
            InstanceStatus::Offline | InstanceStatus::Crashed
        ) {
            return Ok(());
        }

        if graceful {
            self.registry.mutate(id, |i| i.status = InstanceStatus::Draining);
            if let Err(e) = self.control.send_to(id, OutboundFrame::GracefulShutdown).await {
                debug!("instance {id}: graceful shutdown frame not delivered ({e}), waiting anyway");
            }

            let deadline = Instant::now() + GRACEFUL_STOP_TIMEOUT;
            while Instant::now() < deadline {
                if self.is_offline(id) {
                    metrics::PROCESS_STOPS_TOTAL.with_label_values(&["graceful"]).inc();
                    return Ok(());
                }
                tokio::time::sleep(GRACEFUL_POLL_INTERVAL).await;
            }
            warn!("instance {id}: graceful stop timed out, escalating to hard kill");
        }

        self.registry.mutate(id, |i| i.status = InstanceStatus::Stopping);
        self.hard_kill(id).await;
        metrics::PROCESS_STOPS_TOTAL.with_label_values(&["killed"]).inc();
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, id: u32) -> FleetResult<()> {
        self.stop(id, true).await?;
        self.start(id).await
    }

    /// Starts every registered instance, staggered by [`BULK_START_STAGGER`]
    /// so launches don't collide on disk/port setup.
    pub async fn start_all(self: &Arc<Self>) -> FleetResult<()> {
        let ids: Vec<u32> = self.registry.snapshot().iter().map(|i| i.id).collect();
        let mut set = JoinSet::new();
        for id in ids {
            let this = self.clone();
            set.spawn(async move { (id, this.start(id).await) });
            tokio::time::sleep(BULK_START_STAGGER).await;
        }
        while let Some(res) = set.join_next().await {
            match res {
                Ok((id, Err(e))) => warn!("start_all: instance {id} failed to start: {e}"),
                Err(e) => warn!("start_all: task join error: {e}"),
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn stop_all(self: &Arc<Self>) -> FleetResult<()> {
        let ids: Vec<u32> = self.registry.snapshot().iter().map(|i| i.id).collect();
        let mut set = JoinSet::new();
        for id in ids {
            let this = self.clone();
            set.spawn(async move { (id, this.stop(id, true).await) });
        }
        while let Some(res) = set.join_next().await {
            match res {
                Ok((id, Err(e))) => warn!("stop_all: instance {id} failed to stop: {e}"),
                Err(e) => warn!("stop_all: task join error: {e}"),
                _ => {}
            }
        }
        Ok(())
    }

    fn is_offline(&self, id: u32) -> bool {
        self.registry
            .get(id)
            .map(|i| matches!(i.status, InstanceStatus::Offline | InstanceStatus::Crashed))
            .unwrap_or(true)
    }

    async fn hard_kill(&self, id: u32) {
        if let Some(child) = self.children.get(&id).map(|e| e.clone()) {
            let mut guard = child.lock().await;
            let _ = guard.start_kill();
        }
    }

    /// Spawns the task that owns the child's lifetime past the initial
    /// announce: it blocks on `wait()` and reconciles the registry however
    /// the process actually exits, whether requested or not.
    fn spawn_watcher(self: &Arc<Self>, id: u32) {
        let this = self.clone();
        tokio::spawn(async move {
            let Some(child) = this.children.get(&id).map(|e| e.clone()) else {
                return;
            };
            let status = child.lock().await.wait().await;
            this.children.remove(&id);

            let was_requested = this
                .registry
                .get(id)
                .map(|i| matches!(i.status, InstanceStatus::Draining | InstanceStatus::Stopping))
                .unwrap_or(false);

            this.registry.mutate(id, |i| {
                i.status = if was_requested {
                    InstanceStatus::Offline
                } else {
                    InstanceStatus::Crashed
                };
                i.pid = None;
                i.roster.clear();
                i.player_count = 0;
                i.game_phase = Default::default();
                i.match_started = false;
                i.match_started_at = None;
            });
            this.events.publish(FleetEvent::ServerOffline { instance_id: id });

            match status {
                Ok(status) if was_requested => {
                    debug!("instance {id}: process exited cleanly ({status})");
                }
                Ok(status) => {
                    warn!("instance {id}: process exited unexpectedly ({status})");
                }
                Err(e) => {
                    warn!("instance {id}: failed to reap process: {e}");
                }
            }
        });
    }
}

/// Waits for a `ServerReady` event naming `id`, ignoring everything else
/// (including lag — a lagged receiver just re-subscribes to the live tail,
/// which is fine here since we only care about the next matching event).
async fn wait_for_ready(rx: &mut tokio::sync::broadcast::Receiver<FleetEvent>, id: u32) {
    loop {
        match rx.recv().await {
            Ok(FleetEvent::ServerReady { instance_id }) if instance_id == id => return,
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_ports_reexported_for_other_modules() {
        let config = crate::config::Config::default();
        let (game, voice, _public) = argv::derive_ports(&config, 2);
        assert_eq!(game, config.host.base_game_port + 1);
        assert_eq!(voice, config.host.base_voice_port + 1);
    }
}
