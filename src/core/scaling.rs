// src/core/scaling.rs

//! The scaling engine (C8): add/remove/scale-to/auto-balance operations
//! layered over a small provider trait so these operations can be unit
//! tested against an in-memory fake without spawning real processes (§4.8).

use async_trait::async_trait;

use crate::core::capacity;
use crate::core::errors::{FleetError, FleetResult};
use crate::core::registry::{Instance, InstanceStatus};

/// The minimal surface the scaling engine needs from the registry and
/// supervisor. Production wiring implements this over
/// [`crate::core::registry::InstanceRegistry`] and
/// [`crate::core::supervisor::ProcessSupervisor`]; tests implement it over an
/// in-memory fake.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    fn instances(&self) -> Vec<Instance>;
    fn add_new_server(&self) -> u32;
    async fn start(&self, id: u32) -> FleetResult<()>;
    async fn stop(&self, id: u32, graceful: bool) -> FleetResult<()>;
}

/// Configuration the scaling engine consults for every operation (§4.8:
/// `max = min(configured_total, capacity_calculator())`).
#[derive(Debug, Clone, Copy)]
pub struct ScalingLimits {
    pub configured_total: usize,
    pub cpu_count: usize,
    pub per_core_factor: f64,
    pub min_idle_ready: usize,
    pub min_total: usize,
}

impl ScalingLimits {
    pub fn max_allowed(&self) -> usize {
        self.configured_total
            .min(capacity::max_allowed_servers(self.cpu_count, self.per_core_factor))
    }
}

/// The priority order `remove(n, false)` picks candidates in: idle first,
/// then merely-Ready, then Occupied-with-zero-clients, then any Occupied
/// instance if `force` is set (§4.8).
fn removal_priority(instance: &Instance) -> Option<u8> {
    match instance.status {
        InstanceStatus::Ready if instance.player_count == 0 => Some(0),
        InstanceStatus::Ready => Some(1),
        InstanceStatus::Occupied if instance.player_count == 0 => Some(2),
        InstanceStatus::Occupied => Some(3),
        _ => None,
    }
}

#[async_trait]
impl<T: FleetProvider + ?Sized> FleetProvider for std::sync::Arc<T> {
    fn instances(&self) -> Vec<Instance> {
        (**self).instances()
    }

    fn add_new_server(&self) -> u32 {
        (**self).add_new_server()
    }

    async fn start(&self, id: u32) -> FleetResult<()> {
        (**self).start(id).await
    }

    async fn stop(&self, id: u32, graceful: bool) -> FleetResult<()> {
        (**self).stop(id, graceful).await
    }
}

pub struct ScalingEngine<P: FleetProvider> {
    provider: P,
}

impl<P: FleetProvider> ScalingEngine<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Adds `n` new instances: registers each (assigning `max(id)+1`,
    /// preserving any gaps left by prior removals per §9) then starts it.
    pub async fn add(&self, n: usize, limits: &ScalingLimits) -> FleetResult<Vec<u32>> {
        if n == 0 {
            return Err(FleetError::Scaling("invalid n: must be greater than zero".into()));
        }
        let current = self.provider.instances().len();
        let max = limits.max_allowed();
        if current + n > max {
            return Err(FleetError::Scaling(format!(
                "cannot add {n} instances: at maximum ({current}/{max})"
            )));
        }

        let mut added = Vec::with_capacity(n);
        for _ in 0..n {
            added.push(self.provider.add_new_server());
        }
        for &id in &added {
            self.provider.start(id).await?;
        }
        Ok(added)
    }

    /// Removes up to `n` instances, chosen by [`removal_priority`]. When
    /// `force` is false, Occupied instances are never eligible candidates.
    pub async fn remove(&self, n: usize, force: bool) -> FleetResult<Vec<u32>> {
        if n == 0 {
            return Err(FleetError::Scaling("invalid n: must be greater than zero".into()));
        }

        let mut candidates: Vec<Instance> = self
            .provider
            .instances()
            .into_iter()
            .filter(|i| match removal_priority(i) {
                Some(p) => force || p < 3,
                None => false,
            })
            .collect();
        if candidates.is_empty() {
            return Err(FleetError::Scaling("no eligible servers to remove".into()));
        }
        candidates.sort_by_key(|i| (removal_priority(i).unwrap_or(u8::MAX), i.id));

        let mut removed = Vec::new();
        for instance in candidates.into_iter().take(n) {
            self.provider.stop(instance.id, true).await?;
            removed.push(instance.id);
        }
        Ok(removed)
    }

    /// Scales the running fleet to exactly `t` instances (clamped to
    /// `[0, max]` — see P5), delegating to [`Self::add`]/[`Self::remove`] for
    /// the delta.
    pub async fn scale_to(&self, t: usize, limits: &ScalingLimits) -> FleetResult<()> {
        let max = limits.max_allowed();
        let target = t.min(max);
        let current = self.provider.instances().len();

        if target > current {
            self.add(target - current, limits).await?;
        } else if target < current {
            self.remove(current - target, false).await?;
        }
        Ok(())
    }

    /// Keeps the idle pool around `min_idle_ready`: adds when starved
    /// (bounded by `max`), removes one at a time when there is clear slack
    /// (§4.8). A no-op on an already-balanced fleet (P7).
    pub async fn auto_balance(&self, limits: &ScalingLimits) -> FleetResult<()> {
        let instances = self.provider.instances();
        let idle = instances.iter().filter(|i| i.is_idle()).count();
        let total = instances.len();
        let max = limits.max_allowed();

        if idle < limits.min_idle_ready {
            let wanted = limits.min_idle_ready - idle;
            let room = max.saturating_sub(total);
            let to_add = wanted.min(room);
            if to_add > 0 {
                self.add(to_add, limits).await?;
            }
        } else if idle > limits.min_idle_ready + 1 && total > limits.min_total {
            self.remove(1, false).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeProvider {
        instances: Mutex<Vec<Instance>>,
        next_id: Mutex<u32>,
        started: Mutex<Vec<u32>>,
        stopped: Mutex<Vec<u32>>,
    }

    impl FakeProvider {
        fn new(instances: Vec<Instance>) -> Self {
            let next_id = instances.iter().map(|i| i.id).max().unwrap_or(0) + 1;
            Self {
                instances: Mutex::new(instances),
                next_id: Mutex::new(next_id),
                started: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FleetProvider for FakeProvider {
        fn instances(&self) -> Vec<Instance> {
            self.instances.lock().unwrap().clone()
        }

        fn add_new_server(&self) -> u32 {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            let mut instance = Instance::new(id, 7900 + id as u16, 7950 + id as u16, None);
            instance.status = InstanceStatus::Offline;
            self.instances.lock().unwrap().push(instance);
            id
        }

        async fn start(&self, id: u32) -> FleetResult<()> {
            self.started.lock().unwrap().push(id);
            let mut instances = self.instances.lock().unwrap();
            if let Some(i) = instances.iter_mut().find(|i| i.id == id) {
                i.status = InstanceStatus::Ready;
            }
            Ok(())
        }

        async fn stop(&self, id: u32, _graceful: bool) -> FleetResult<()> {
            self.stopped.lock().unwrap().push(id);
            let mut instances = self.instances.lock().unwrap();
            instances.retain(|i| i.id != id);
            Ok(())
        }
    }

    fn default_limits() -> ScalingLimits {
        ScalingLimits {
            configured_total: 10,
            cpu_count: 64,
            per_core_factor: 1.0,
            min_idle_ready: 2,
            min_total: 0,
        }
    }

    #[tokio::test]
    async fn add_starts_each_newly_registered_instance() {
        let provider = FakeProvider::new(vec![]);
        let engine = ScalingEngine::new(provider);
        let ids = engine.add(3, &default_limits()).await.unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(engine.provider.started.lock().unwrap().clone(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn add_beyond_max_is_rejected() {
        let provider = FakeProvider::new(vec![]);
        let engine = ScalingEngine::new(provider);
        let mut limits = default_limits();
        limits.configured_total = 2;
        let err = engine.add(3, &limits).await.unwrap_err();
        assert!(matches!(err, FleetError::Scaling(_)));
    }

    #[tokio::test]
    async fn remove_prefers_idle_then_ready_then_occupied_with_zero_clients() {
        let mut idle = Instance::new(1, 7900, 7950, None);
        idle.status = InstanceStatus::Ready;
        let mut occupied_empty = Instance::new(2, 7901, 7951, None);
        occupied_empty.status = InstanceStatus::Occupied;
        occupied_empty.player_count = 0;
        let mut occupied = Instance::new(3, 7902, 7952, None);
        occupied.status = InstanceStatus::Occupied;
        occupied.player_count = 5;

        let provider = FakeProvider::new(vec![occupied, occupied_empty, idle]);
        let engine = ScalingEngine::new(provider);
        let removed = engine.remove(2, false).await.unwrap();
        assert_eq!(removed, vec![1, 2]);
    }

    #[tokio::test]
    async fn remove_without_force_never_picks_an_occupied_instance() {
        let mut occupied = Instance::new(1, 7900, 7950, None);
        occupied.status = InstanceStatus::Occupied;
        occupied.player_count = 5;
        let provider = FakeProvider::new(vec![occupied]);
        let engine = ScalingEngine::new(provider);
        let err = engine.remove(1, false).await.unwrap_err();
        assert!(matches!(err, FleetError::Scaling(_)));
    }

    #[tokio::test]
    async fn scale_to_terminates_at_the_clamped_target() {
        let provider = FakeProvider::new(vec![]);
        let engine = ScalingEngine::new(provider);
        let mut limits = default_limits();
        limits.configured_total = 5;
        engine.scale_to(3, &limits).await.unwrap();
        assert_eq!(engine.provider.instances().len(), 3);

        engine.scale_to(100, &limits).await.unwrap();
        assert_eq!(engine.provider.instances().len(), 5);
    }

    #[tokio::test]
    async fn auto_balance_adds_up_to_min_idle_ready_when_starved() {
        let mut occupied = Instance::new(1, 7900, 7950, None);
        occupied.status = InstanceStatus::Occupied;
        occupied.player_count = 3;
        let provider = FakeProvider::new(vec![occupied.clone(), occupied.clone(), occupied]);
        let engine = ScalingEngine::new(provider);

        let limits = default_limits();
        engine.auto_balance(&limits).await.unwrap();
        assert_eq!(engine.provider.instances().len(), 5);
    }

    #[tokio::test]
    async fn auto_balance_is_idempotent_on_a_stable_fleet() {
        let mut idle1 = Instance::new(1, 7900, 7950, None);
        idle1.status = InstanceStatus::Ready;
        let mut idle2 = Instance::new(2, 7901, 7951, None);
        idle2.status = InstanceStatus::Ready;
        let mut occupied = Instance::new(3, 7902, 7952, None);
        occupied.status = InstanceStatus::Occupied;
        occupied.player_count = 3;

        let provider = FakeProvider::new(vec![idle1, idle2, occupied]);
        let engine = ScalingEngine::new(provider);
        let limits = default_limits();

        engine.auto_balance(&limits).await.unwrap();
        assert_eq!(engine.provider.instances().len(), 3);
        engine.auto_balance(&limits).await.unwrap();
        assert_eq!(engine.provider.instances().len(), 3);
    }
}
