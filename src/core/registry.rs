// src/core/registry.rs

//! The canonical in-memory table of instances (C6): a concurrent map keyed by
//! id, with per-id serialised mutation and read-only snapshot views.

use std::sync::Weak;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::core::control::session::ControlSession;

/// The lifecycle status of an instance, per the C3 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum InstanceStatus {
    Offline,
    Starting,
    Ready,
    Occupied,
    Draining,
    Stopping,
    Crashed,
}

/// The in-game phase reported by the `0x42` status frame's byte offset 40.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GamePhase {
    #[default]
    Idle,
    Lobby,
    HeroSelect,
    Loading,
    PreGame,
    Playing,
    Ending,
    PostGame,
}

impl GamePhase {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => GamePhase::Lobby,
            2 => GamePhase::HeroSelect,
            3 => GamePhase::Loading,
            4 => GamePhase::PreGame,
            5 => GamePhase::Playing,
            6 => GamePhase::Ending,
            7 => GamePhase::PostGame,
            _ => GamePhase::Idle,
        }
    }
}

/// One roster entry attached to a `0x42` status frame (see §4.5 roster tail).
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRosterEntry {
    pub account_id: i32,
    pub external_ip: String,
    pub display_name: String,
    pub location_code: String,
    pub ping_min: u16,
    pub ping_avg: u16,
    pub ping_max: u16,
    /// Resolved by joining to a file-log-derived slot map; `None` when no map
    /// entry exists yet (the player is tentatively treated as a spectator by
    /// callers, never guessed here).
    pub slot: Option<u8>,
}

/// Join point for the file-log-derived slot map (an external collaborator,
/// §1): maps an account id to its roster slot (0..4 team A, 5..9 team B,
/// else spectator). `None` when the map has no entry yet for this account,
/// in which case the player stays unassigned rather than being guessed.
pub fn resolve_slot(account_id: i32, slot_map: Option<&std::collections::HashMap<i32, u8>>) -> Option<u8> {
    slot_map.and_then(|map| map.get(&account_id).copied())
}

/// One managed game-server instance.
///
/// Ports (`id`, `game_port`, `voice_port`, `manager_port`) are immutable once
/// an instance is registered; everything else mutates over the instance's
/// lifetime as status frames and process events arrive.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u32,
    pub game_port: u16,
    pub voice_port: u16,
    pub manager_port: Option<u16>,

    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub start_time: Option<Instant>,
    pub last_status_at: Option<Instant>,
    pub cpu_percent: f32,
    pub resident_memory_bytes: u64,
    pub player_count: usize,
    pub game_phase: GamePhase,
    pub match_started: bool,
    pub match_started_at: Option<Instant>,
    pub roster: Vec<PlayerRosterEntry>,
    pub restart_scheduled: bool,
    pub restart_scheduled_at: Option<Instant>,
    pub target_uptime: std::time::Duration,
    pub proxy_enabled: bool,
    pub public_port: u16,

    /// Weak reference to the bound C5 control session, if any. Control
    /// sessions are owned exclusively by the listener (§5); the registry only
    /// observes them to let C3/C8 issue out-of-band writes.
    pub session: Option<Weak<AsyncMutex<ControlSession>>>,
}

impl Instance {
    pub fn new(id: u32, game_port: u16, voice_port: u16, manager_port: Option<u16>) -> Self {
        Self {
            id,
            game_port,
            voice_port,
            manager_port,
            status: InstanceStatus::Offline,
            pid: None,
            start_time: None,
            last_status_at: None,
            cpu_percent: 0.0,
            resident_memory_bytes: 0,
            player_count: 0,
            game_phase: GamePhase::Idle,
            match_started: false,
            match_started_at: None,
            roster: Vec::new(),
            restart_scheduled: false,
            restart_scheduled_at: None,
            target_uptime: std::time::Duration::from_secs(0),
            proxy_enabled: false,
            public_port: game_port,
        }
    }

    /// Is the instance idle: Ready with no connected players.
    pub fn is_idle(&self) -> bool {
        self.status == InstanceStatus::Ready && self.player_count == 0
    }
}

/// Aggregate counts computed from a registry snapshot, on demand.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrySummary {
    pub total: usize,
    pub online: usize,
    pub idle: usize,
    pub occupied: usize,
    pub total_players: usize,
}

/// Concurrent instance table, keyed by id. Enumeration order is ascending id.
///
/// Mutation of a single instance is serialised by `DashMap`'s per-shard
/// locking of that entry; two different ids may be mutated concurrently.
/// Snapshots returned to callers are value copies (`Instance` is `Clone`), so
/// callers never hold a reference across an await point.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: DashMap<u32, Instance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Adds a new instance, assigning it `max(existing_id) + 1` (or `1` if
    /// empty). Per the design notes this deliberately does not fill gaps left
    /// by prior removals.
    pub fn add_new(&self, game_port: u16, voice_port: u16, manager_port: Option<u16>) -> u32 {
        let next_id = self
            .instances
            .iter()
            .map(|entry| *entry.key())
            .max()
            .map(|max_id| max_id + 1)
            .unwrap_or(1);
        self.instances
            .insert(next_id, Instance::new(next_id, game_port, voice_port, manager_port));
        next_id
    }

    pub fn remove(&self, id: u32) -> Option<Instance> {
        self.instances.remove(&id).map(|(_, v)| v)
    }

    pub fn clear(&self) {
        self.instances.clear();
    }

    pub fn get(&self, id: u32) -> Option<Instance> {
        self.instances.get(&id).map(|r| r.clone())
    }

    /// Applies `f` to the instance with `id` while holding the shard lock for
    /// that entry, serialising concurrent mutations of the same id.
    pub fn mutate<R>(&self, id: u32, f: impl FnOnce(&mut Instance) -> R) -> Option<R> {
        self.instances.get_mut(&id).map(|mut entry| f(&mut entry))
    }

    /// A read-only snapshot of every instance, ordered by ascending id.
    pub fn snapshot(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.instances.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|i| i.id);
        all
    }

    pub fn find_by_game_port(&self, game_port: u16) -> Option<Instance> {
        self.instances
            .iter()
            .find(|e| e.game_port == game_port)
            .map(|e| e.value().clone())
    }

    pub fn summary(&self) -> RegistrySummary {
        let snapshot = self.snapshot();
        let mut summary = RegistrySummary {
            total: snapshot.len(),
            ..Default::default()
        };
        for instance in &snapshot {
            summary.total_players += instance.player_count;
            match instance.status {
                InstanceStatus::Ready if instance.player_count == 0 => summary.idle += 1,
                InstanceStatus::Ready | InstanceStatus::Occupied => summary.occupied += 1,
                _ => {}
            }
            if !matches!(instance.status, InstanceStatus::Offline | InstanceStatus::Crashed) {
                summary.online += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_slot_is_none_without_a_slot_map() {
        assert_eq!(resolve_slot(42, None), None);
    }

    #[test]
    fn resolve_slot_looks_up_the_account_id_in_the_map() {
        let mut map = std::collections::HashMap::new();
        map.insert(42, 3u8);
        assert_eq!(resolve_slot(42, Some(&map)), Some(3));
        assert_eq!(resolve_slot(7, Some(&map)), None);
    }

    #[test]
    fn add_new_assigns_max_plus_one_preserving_gaps() {
        let registry = InstanceRegistry::new();
        let a = registry.add_new(7777, 7778, None);
        let b = registry.add_new(7779, 7780, None);
        assert_eq!((a, b), (1, 2));

        registry.remove(a);
        let c = registry.add_new(7781, 7782, None);
        // id 1 was removed; the next id is max(existing)+1 = 3, not the gap at 1.
        assert_eq!(c, 3);
    }

    #[test]
    fn add_new_on_empty_registry_starts_at_one() {
        let registry = InstanceRegistry::new();
        assert_eq!(registry.add_new(1, 2, None), 1);
    }

    #[test]
    fn mutate_is_visible_through_subsequent_get() {
        let registry = InstanceRegistry::new();
        let id = registry.add_new(1, 2, None);
        registry.mutate(id, |i| i.status = InstanceStatus::Ready);
        assert_eq!(registry.get(id).unwrap().status, InstanceStatus::Ready);
    }

    #[test]
    fn snapshot_is_ordered_by_ascending_id() {
        let registry = InstanceRegistry::new();
        registry.add_new(1, 2, None);
        registry.add_new(3, 4, None);
        registry.add_new(5, 6, None);
        let ids: Vec<u32> = registry.snapshot().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn summary_counts_idle_occupied_and_players() {
        let registry = InstanceRegistry::new();
        let idle = registry.add_new(1, 2, None);
        let occupied = registry.add_new(3, 4, None);
        registry.mutate(idle, |i| i.status = InstanceStatus::Ready);
        registry.mutate(occupied, |i| {
            i.status = InstanceStatus::Occupied;
            i.player_count = 5;
        });

        let summary = registry.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.online, 2);
        assert_eq!(summary.idle, 1);
        assert_eq!(summary.occupied, 1);
        assert_eq!(summary.total_players, 5);
    }
}
