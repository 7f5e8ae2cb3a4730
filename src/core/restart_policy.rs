// src/core/restart_policy.rs

//! The restart policy (C9): gives every instance a randomised target uptime
//! and recycles it through C3 once that target is exceeded, preferring to
//! wait for an empty roster over cutting a match short (§4.9).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::core::registry::InstanceRegistry;
use crate::core::supervisor::ProcessSupervisor;

/// Draws a fresh target uptime uniformly from `[min, max]`. Falls back to
/// `min` when the window is empty or inverted rather than panicking on a
/// malformed config.
fn draw_target_uptime(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let span = (max - min).as_secs_f64();
    let offset = rng.gen_range(0.0..=span);
    min + Duration::from_secs_f64(offset)
}

/// Drives the periodic uptime sweep and the manual schedule/cancel entry
/// points used by the CLI/RPC surface (§4.9).
pub struct RestartPolicy {
    registry: Arc<InstanceRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    config: ConfigHandle,
}

impl RestartPolicy {
    pub fn new(registry: Arc<InstanceRegistry>, supervisor: Arc<ProcessSupervisor>, config: ConfigHandle) -> Arc<Self> {
        Arc::new(Self {
            registry,
            supervisor,
            config,
        })
    }

    /// Forces `restart_scheduled` on regardless of uptime, recording `reason`
    /// for diagnostics.
    pub fn schedule_immediate(&self, id: u32, reason: &str) {
        let scheduled = self.registry.mutate(id, |i| {
            i.restart_scheduled = true;
            i.restart_scheduled_at = Some(Instant::now());
        });
        if scheduled.is_some() {
            info!("instance {id}: restart scheduled immediately ({reason})");
        }
    }

    pub fn cancel_scheduled(&self, id: u32) {
        self.registry.mutate(id, |i| {
            i.restart_scheduled = false;
            i.restart_scheduled_at = None;
        });
    }

    /// Assigns every instance currently missing a target uptime a fresh one,
    /// so instances added after startup are covered without waiting for
    /// their first sweep to notice a zero target.
    fn seed_targets(&self, min: Duration, max: Duration) {
        for instance in self.registry.snapshot() {
            if instance.target_uptime.is_zero() {
                let target = draw_target_uptime(min, max);
                self.registry.mutate(instance.id, |i| i.target_uptime = target);
            }
        }
    }

    /// One sweep pass: marks instances past their target as scheduled, then
    /// restarts any scheduled instance that is either idle or has waited
    /// longer than `max_wait_for_game` since being scheduled (§4.9).
    async fn sweep_once(&self, max_wait_for_game: Duration) {
        for instance in self.registry.snapshot() {
            let Some(start_time) = instance.start_time else {
                continue;
            };
            let uptime = start_time.elapsed();

            if !instance.restart_scheduled && uptime >= instance.target_uptime {
                self.registry.mutate(instance.id, |i| {
                    i.restart_scheduled = true;
                    i.restart_scheduled_at = Some(Instant::now());
                });
                debug!("instance {}: uptime {:?} reached target, restart scheduled", instance.id, uptime);
                continue;
            }

            if !instance.restart_scheduled {
                continue;
            }

            let waited = instance
                .restart_scheduled_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            let roster_empty = instance.player_count == 0;
            if roster_empty || waited >= max_wait_for_game {
                self.recycle(instance.id).await;
            }
        }
    }

    /// Runs C3's graceful stop-then-start, then redraws the target and
    /// clears the scheduled flag (§4.9). A failed restart leaves the flag set
    /// so the next sweep retries.
    async fn recycle(&self, id: u32) {
        let (min_uptime, max_uptime) = {
            let config = self.config.current();
            (config.restart_policy.min_uptime, config.restart_policy.max_uptime)
        };

        info!("instance {id}: recycling via scheduled restart");
        match self.supervisor.restart(id).await {
            Ok(()) => {
                let target = draw_target_uptime(min_uptime, max_uptime);
                self.registry.mutate(id, |i| {
                    i.restart_scheduled = false;
                    i.restart_scheduled_at = None;
                    i.target_uptime = target;
                });
            }
            Err(e) => {
                warn!("instance {id}: scheduled restart failed, will retry next sweep: {e}");
            }
        }
    }

    /// Runs the sweep loop on `check_interval` until `shutdown_rx` fires.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let (min_uptime, max_uptime, check_interval, max_wait_for_game) = {
                let config = self.config.current();
                (
                    config.restart_policy.min_uptime,
                    config.restart_policy.max_uptime,
                    config.restart_policy.check_interval,
                    config.restart_policy.max_wait_for_game,
                )
            };

            self.seed_targets(min_uptime, max_uptime);
            self.sweep_once(max_wait_for_game).await;

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(check_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_target_uptime_stays_within_bounds() {
        let min = Duration::from_secs(6 * 3600);
        let max = Duration::from_secs(12 * 3600);
        for _ in 0..100 {
            let target = draw_target_uptime(min, max);
            assert!(target >= min && target <= max);
        }
    }

    #[test]
    fn draw_target_uptime_falls_back_to_min_on_inverted_window() {
        let min = Duration::from_secs(10);
        let max = Duration::from_secs(5);
        assert_eq!(draw_target_uptime(min, max), min);
    }

    #[test]
    fn draw_target_uptime_is_min_on_equal_bounds() {
        let bound = Duration::from_secs(3600);
        assert_eq!(draw_target_uptime(bound, bound), bound);
    }
}
