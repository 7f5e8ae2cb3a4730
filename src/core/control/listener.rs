// src/core/control/listener.rs

//! The control-channel accept loop and per-session frame dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::AbortHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use super::codec::ControlCodec;
use super::frame::{ControlFrame, OutboundFrame};
use super::session::ControlSession;
use crate::core::errors::FleetError;
use crate::core::events::{EventBus, FleetEvent};
use crate::core::registry::{InstanceRegistry, InstanceStatus};

/// Owns the live control sessions, keyed by instance id, and provides the
/// out-of-band send API used by the process supervisor and scaling engine.
///
/// Sessions are owned exclusively here; the registry only holds a `Weak`
/// reference (§5 shared resources) so that removing an instance never has to
/// coordinate with an in-flight connection task.
pub struct ControlPlane {
    pub registry: Arc<InstanceRegistry>,
    pub events: Arc<EventBus>,
    sessions: DashMap<u32, (Arc<AsyncMutex<ControlSession>>, AbortHandle)>,
}

impl ControlPlane {
    pub fn new(registry: Arc<InstanceRegistry>, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            sessions: DashMap::new(),
        })
    }

    /// Sends an out-of-band frame to the instance's bound session.
    /// Returns `NotConnected` without touching the network if no session is
    /// bound (R3).
    pub async fn send_to(&self, instance_id: u32, frame: OutboundFrame) -> Result<(), FleetError> {
        let session = self.sessions.get(&instance_id).map(|e| e.0.clone());
        match session {
            Some(session) => session.lock().await.send(frame).await,
            None => Err(FleetError::NotConnected(instance_id)),
        }
    }

    pub fn is_bound(&self, instance_id: u32) -> bool {
        self.sessions.contains_key(&instance_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Binds a newly-announced session to `instance_id`, superseding and
    /// closing any prior session for that id (I2, S6).
    fn bind(&self, instance_id: u32, session: Arc<AsyncMutex<ControlSession>>, abort: AbortHandle) {
        if let Some((_, old_abort)) = self.sessions.insert(instance_id, (session.clone(), abort)) {
            old_abort.abort();
            debug!("instance {instance_id}: new announce superseded the prior control session");
        }
        self.registry.mutate(instance_id, |i| {
            i.session = Some(Arc::downgrade(&session));
        });
    }

    /// Removes the session bound for `instance_id`, but only if `session` is
    /// still the one currently bound. A session's own natural close can lose
    /// a race against `bind` superseding it (the abort signal only takes
    /// effect at the old task's next await point), so this must not clear a
    /// newer session's state out from under it (I2).
    ///
    /// Returns `true` if `session` was the currently-bound one and has now
    /// been removed; `false` if it had already been superseded, in which case
    /// the caller must not touch the instance's registry state either.
    fn unbind(&self, instance_id: u32, session: &Arc<AsyncMutex<ControlSession>>) -> bool {
        let still_current = self
            .sessions
            .get(&instance_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.0, session));
        if !still_current {
            return false;
        }
        self.sessions.remove(&instance_id);
        self.registry.mutate(instance_id, |i| {
            i.session = None;
        });
        true
    }
}

/// Runs the control-channel accept loop until `shutdown_rx` fires. Only a
/// bind failure at startup is surfaced as an error; at steady state the
/// listener is infallible (§4.5 failure semantics).
pub async fn run_listener(
    addr: SocketAddr,
    plane: Arc<ControlPlane>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    let listener = TcpListener::bind(addr).await?;
    info!("control-channel listener bound on {addr}");

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("control-channel listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        spawn_session(socket, peer_addr, plane.clone(), shutdown_rx.resubscribe());
                    }
                    Err(e) => warn!("failed to accept control-channel connection: {e}"),
                }
            }
        }
    }
}

fn spawn_session(
    socket: TcpStream,
    peer_addr: SocketAddr,
    plane: Arc<ControlPlane>,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let (abort_tx, abort_rx) = tokio::sync::oneshot::channel();
    let join = tokio::spawn(async move {
        let abort_handle = abort_rx.await.ok();
        handle_connection(socket, peer_addr, plane, shutdown_rx, abort_handle).await;
    });
    // The task's first action is to await this; sending after spawn is safe.
    let _ = abort_tx.send(join.abort_handle());
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    plane: Arc<ControlPlane>,
    mut shutdown_rx: broadcast::Receiver<()>,
    abort_handle: Option<AbortHandle>,
) {
    let Some(abort_handle) = abort_handle else {
        return;
    };
    let (read_half, write_half) = tokio::io::split(socket);
    let mut reader = FramedRead::new(read_half, ControlCodec);
    let session = Arc::new(AsyncMutex::new(ControlSession::new(peer_addr, write_half)));

    let first_frame = tokio::select! {
        biased;
        _ = shutdown_rx.recv() => return,
        frame = reader.next() => frame,
    };

    let instance_id = match first_frame {
        Some(Ok(ControlFrame::Announce { game_port })) => {
            match plane.registry.find_by_game_port(game_port) {
                Some(instance) => instance.id,
                None => {
                    debug!("dropping session from {peer_addr}: no instance registered for port {game_port}");
                    return;
                }
            }
        }
        Some(Ok(other)) => {
            debug!("dropping session from {peer_addr}: first frame must be 0x40, got {other:?}");
            return;
        }
        Some(Err(e)) => {
            debug!("dropping session from {peer_addr}: {e}");
            return;
        }
        None => return,
    };

    {
        let mut guard = session.lock().await;
        guard.bind(instance_id);
        guard.touch();
    }
    plane.bind(instance_id, session.clone(), abort_handle);

    let was_ready = plane.registry.mutate(instance_id, |i| {
        i.status = InstanceStatus::Ready;
        i.last_status_at = Some(Instant::now());
    });
    if was_ready.is_some() {
        plane.events.publish(FleetEvent::ServerReady { instance_id });
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            frame = reader.next() => frame,
        };

        match next {
            Some(Ok(ControlFrame::Announce { .. })) => {
                debug!("instance {instance_id}: unexpected re-announce on a bound session, dropping");
                break;
            }
            Some(Ok(ControlFrame::Closed)) => {
                debug!("instance {instance_id}: child reported closed (0x41)");
                break;
            }
            Some(Ok(ControlFrame::Status(status))) => {
                session.lock().await.touch();
                apply_status(&plane, instance_id, status);
            }
            Some(Err(e)) => {
                debug!("instance {instance_id}: protocol error, dropping session: {e}");
                break;
            }
            None => {
                debug!("instance {instance_id}: connection closed without 0x41");
                break;
            }
        }
    }

    if !plane.unbind(instance_id, &session) {
        // A newer session already superseded this one (I2); it owns the
        // instance's registry state now, so this task must not touch it.
        return;
    }
    plane.registry.mutate(instance_id, |i| {
        i.status = InstanceStatus::Offline;
        i.roster.clear();
        i.player_count = 0;
        i.game_phase = Default::default();
        i.match_started = false;
        i.match_started_at = None;
    });
    plane.events.publish(FleetEvent::ServerOffline { instance_id });
}

fn apply_status(plane: &Arc<ControlPlane>, instance_id: u32, status: super::frame::StatusFrame) {
    let mut became_occupied = false;
    let mut became_ready = false;
    let mut match_started_event = false;
    let mut match_ended_event: Option<std::time::Duration> = None;
    // Only populated when the roster was actually rebuilt this frame; the
    // no-tail fallback leaves `instance.roster` untouched, so there is no
    // join/leave diff to compute against it (I4).
    let mut roster_diff: Option<(std::collections::HashSet<i32>, std::collections::HashSet<i32>)> = None;

    let mutated = plane.registry.mutate(instance_id, |instance| {
        instance.last_status_at = Some(Instant::now());
        instance.cpu_percent = status.load_percent;
        instance.game_phase = status.game_phase;
        if status.has_roster_tail || status.num_clients == 0 {
            let old_accounts: std::collections::HashSet<i32> =
                instance.roster.iter().map(|p| p.account_id).collect();

            // No file-log slot map is wired in yet (it's an external
            // collaborator, §1); the join point is exercised here so a future
            // tailer only has to supply `Some(&map)`.
            let mut roster = status.roster.clone();
            for player in &mut roster {
                player.slot = crate::core::registry::resolve_slot(player.account_id, None);
            }
            let new_accounts: std::collections::HashSet<i32> =
                roster.iter().map(|p| p.account_id).collect();
            // When the frame carried roster bytes, the parsed roster is the
            // source of truth for the count even if some anchors were
            // skipped (I4); `num_clients` alone would overstate it.
            instance.player_count = roster.len();
            instance.roster = roster;
            roster_diff = Some((old_accounts, new_accounts));
        } else {
            // No roster bytes were sent this frame; keep the last known
            // roster and fall back to the wire count.
            instance.player_count = status.num_clients as usize;
        }

        let now_occupied = status.num_clients > 0 || status.match_started;
        match instance.status {
            InstanceStatus::Ready if now_occupied => {
                instance.status = InstanceStatus::Occupied;
                became_occupied = true;
            }
            InstanceStatus::Occupied if !now_occupied => {
                instance.status = InstanceStatus::Ready;
                became_ready = true;
            }
            _ => {}
        }

        if status.match_started && !instance.match_started {
            instance.match_started = true;
            instance.match_started_at = Some(Instant::now());
            match_started_event = true;
        } else if !status.match_started && instance.match_started {
            instance.match_started = false;
            if let Some(started_at) = instance.match_started_at.take() {
                match_ended_event = Some(started_at.elapsed());
            }
        }
    });

    if mutated.is_none() {
        return;
    }

    if let Some((old_accounts, new_accounts)) = roster_diff {
        for joined in new_accounts.difference(&old_accounts) {
            plane.events.publish(FleetEvent::PlayerJoined {
                instance_id,
                account_id: *joined,
            });
        }
        for left in old_accounts.difference(&new_accounts) {
            plane.events.publish(FleetEvent::PlayerLeft {
                instance_id,
                account_id: *left,
            });
        }
    }
    if became_occupied {
        plane.events.publish(FleetEvent::ServerOccupied { instance_id });
    }
    if became_ready {
        plane.events.publish(FleetEvent::ServerReady { instance_id });
    }
    if match_started_event {
        plane.events.publish(FleetEvent::MatchStarted { instance_id });
    }
    if let Some(duration) = match_ended_event {
        plane
            .events
            .publish(FleetEvent::MatchEnded { instance_id, duration });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::control::frame::StatusFrame;
    use crate::core::events::EventBus;
    use crate::core::registry::{GamePhase, InstanceRegistry};

    fn new_plane() -> (Arc<ControlPlane>, u32) {
        let registry = Arc::new(InstanceRegistry::new());
        let id = registry.add_new(7900, 7950, None);
        (ControlPlane::new(registry, Arc::new(EventBus::new())), id)
    }

    fn base_status(num_clients: u8, has_roster_tail: bool, roster: Vec<crate::core::registry::PlayerRosterEntry>) -> StatusFrame {
        StatusFrame {
            uptime_secs: 0,
            load_percent: 0.0,
            num_clients,
            match_started: false,
            game_phase: GamePhase::Idle,
            roster,
            has_roster_tail,
        }
    }

    #[test]
    fn player_count_follows_parsed_roster_when_tail_is_present() {
        let (plane, id) = new_plane();
        // num_clients claims 3 but only one anchor validated; the parsed
        // roster, not the wire count, must win (I4).
        let roster = vec![crate::core::registry::PlayerRosterEntry {
            account_id: 1,
            external_ip: "1.2.3.4".into(),
            display_name: "a".into(),
            location_code: "US".into(),
            ping_min: 1,
            ping_avg: 1,
            ping_max: 1,
            slot: None,
        }];
        apply_status(&plane, id, base_status(3, true, roster));
        let instance = plane.registry.get(id).unwrap();
        assert_eq!(instance.player_count, 1);
        assert_eq!(instance.roster.len(), 1);
    }

    #[test]
    fn player_count_falls_back_to_wire_count_without_a_roster_tail() {
        let (plane, id) = new_plane();
        apply_status(&plane, id, base_status(2, false, Vec::new()));
        let instance = plane.registry.get(id).unwrap();
        assert_eq!(instance.player_count, 2);
        assert!(instance.roster.is_empty());
    }

    // Returns the session plus the client-side stream; the caller must keep
    // the latter alive for as long as the session's write half needs to stay
    // valid.
    async fn dummy_session(listener: &TcpListener) -> (Arc<AsyncMutex<ControlSession>>, TcpStream) {
        let connect = TcpStream::connect(listener.local_addr().unwrap());
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        let (_read_half, write_half) = tokio::io::split(accepted.unwrap().0);
        let session = Arc::new(AsyncMutex::new(ControlSession::new(
            "127.0.0.1:0".parse().unwrap(),
            write_half,
        )));
        (session, connected.unwrap())
    }

    #[tokio::test]
    async fn unbind_is_a_noop_once_superseded() {
        let (plane, id) = new_plane();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (old_session, _old_client) = dummy_session(&listener).await;
        let old_abort = tokio::spawn(async {}).abort_handle();
        plane.bind(id, old_session.clone(), old_abort);

        let (new_session, _new_client) = dummy_session(&listener).await;
        let new_abort = tokio::spawn(async {}).abort_handle();
        plane.bind(id, new_session.clone(), new_abort);

        // The old session's own cleanup must not clear the new one's state.
        assert!(!plane.unbind(id, &old_session));
        assert!(plane.is_bound(id));
        assert!(plane.unbind(id, &new_session));
        assert!(!plane.is_bound(id));
    }
}
