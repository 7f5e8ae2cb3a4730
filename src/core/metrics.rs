// src/core/metrics.rs

//! Defines and registers Prometheus metrics for fleet monitoring.
//!
//! Uses `lazy_static` so metrics are registered exactly once for the process
//! lifetime, same as the rest of this codebase's instrumentation.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

use crate::core::events::FleetEvent;

lazy_static! {
    /// Instances currently in each lifecycle state, labeled by status.
    pub static ref INSTANCES_BY_STATUS: CounterVec = register_counter_vec!(
        "fleetd_instance_status_transitions_total",
        "Total instance status transitions, labeled by the status transitioned into.",
        &["status"]
    ).unwrap();

    /// Total players currently connected across the whole fleet.
    pub static ref TOTAL_PLAYERS: Gauge = register_gauge!(
        "fleetd_total_players",
        "Total players currently connected across all instances."
    ).unwrap();

    /// Number of bound control-channel sessions.
    pub static ref CONTROL_SESSIONS: Gauge = register_gauge!(
        "fleetd_control_sessions",
        "Number of instances with a bound control-channel session."
    ).unwrap();

    /// Whether the host is currently authenticated with the master server (1/0).
    pub static ref MASTER_AUTHENTICATED: Gauge = register_gauge!(
        "fleetd_master_authenticated",
        "1 if authenticated with the master server, 0 otherwise."
    ).unwrap();

    /// Whether the chat handshake is currently connected (1/0).
    pub static ref CHAT_CONNECTED: Gauge = register_gauge!(
        "fleetd_chat_connected",
        "1 if the chat keep-alive handshake is connected, 0 otherwise."
    ).unwrap();

    /// Total events dropped by a lagging event-bus sink.
    pub static ref EVENTS_SHED_TOTAL: Counter = register_counter!(
        "fleetd_events_shed_total",
        "Total fleet events dropped because a sink could not keep up."
    ).unwrap();

    /// Total process spawns attempted.
    pub static ref PROCESS_SPAWNS_TOTAL: Counter = register_counter!(
        "fleetd_process_spawns_total",
        "Total child processes spawned by the supervisor."
    ).unwrap();

    /// Total graceful/forced stops issued.
    pub static ref PROCESS_STOPS_TOTAL: CounterVec = register_counter_vec!(
        "fleetd_process_stops_total",
        "Total process stops, labeled by whether they completed gracefully or were killed.",
        &["kind"]
    ).unwrap();

    /// Total matches completed, used to derive match duration distributions externally.
    pub static ref MATCHES_ENDED_TOTAL: Counter = register_counter!(
        "fleetd_matches_ended_total",
        "Total matches that transitioned from started to ended."
    ).unwrap();
}

/// Folds a single fleet event into the relevant counters/gauges.
pub fn record_event(event: &FleetEvent) {
    match event {
        FleetEvent::ServerReady { .. } => INSTANCES_BY_STATUS.with_label_values(&["ready"]).inc(),
        FleetEvent::ServerOccupied { .. } => {
            INSTANCES_BY_STATUS.with_label_values(&["occupied"]).inc()
        }
        FleetEvent::ServerOffline { .. } => {
            INSTANCES_BY_STATUS.with_label_values(&["offline"]).inc()
        }
        FleetEvent::MatchStarted { .. } => {}
        FleetEvent::MatchEnded { .. } => MATCHES_ENDED_TOTAL.inc(),
        FleetEvent::PlayerJoined { .. } => TOTAL_PLAYERS.inc(),
        FleetEvent::PlayerLeft { .. } => TOTAL_PLAYERS.dec(),
        FleetEvent::AuthChanged { authenticated } => {
            MASTER_AUTHENTICATED.set(if *authenticated { 1.0 } else { 0.0 })
        }
        FleetEvent::ChatChanged { connected } => {
            CHAT_CONNECTED.set(if *connected { 1.0 } else { 0.0 })
        }
    }
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
