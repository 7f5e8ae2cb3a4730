// src/core/events.rs

//! Typed event bus fanning out instance lifecycle events to metrics, notifiers,
//! and persistence sinks.

use std::time::Duration;
use tokio::sync::broadcast::{self, Sender as BroadcastSender};
use tracing::debug;

use crate::core::metrics;

/// The capacity of the broadcast channel. Sized generously since events are
/// small and sinks are expected to keep up; a lagging sink sheds rather than
/// stalling producers (see `FleetEvent` delivery semantics below).
const EVENT_BUS_CAPACITY: usize = 4096;

/// A tagged event describing an instance (or fleet-wide) state change.
///
/// Event ordering per instance id is preserved because all producers publish
/// onto the same single broadcast channel: a single channel totally orders
/// every publish, and consumers simply filter by `instance_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    ServerReady { instance_id: u32 },
    ServerOccupied { instance_id: u32 },
    ServerOffline { instance_id: u32 },
    MatchStarted { instance_id: u32 },
    MatchEnded { instance_id: u32, duration: Duration },
    PlayerJoined { instance_id: u32, account_id: i32 },
    PlayerLeft { instance_id: u32, account_id: i32 },
    AuthChanged { authenticated: bool },
    ChatChanged { connected: bool },
}

impl FleetEvent {
    /// The instance this event concerns, if any (fleet-wide events like auth
    /// and chat status changes have no single owning instance).
    pub fn instance_id(&self) -> Option<u32> {
        match self {
            FleetEvent::ServerReady { instance_id }
            | FleetEvent::ServerOccupied { instance_id }
            | FleetEvent::ServerOffline { instance_id }
            | FleetEvent::MatchStarted { instance_id }
            | FleetEvent::MatchEnded { instance_id, .. }
            | FleetEvent::PlayerJoined { instance_id, .. }
            | FleetEvent::PlayerLeft { instance_id, .. } => Some(*instance_id),
            FleetEvent::AuthChanged { .. } | FleetEvent::ChatChanged { .. } => None,
        }
    }
}

/// Central distribution hub for `FleetEvent`s.
///
/// Delivery is non-blocking: publishing never awaits a sink. A sink that
/// falls behind the broadcast channel's capacity simply misses the events it
/// lagged on (observed as `RecvError::Lagged` on its receiver); the shed
/// count is recorded rather than stalling the producer.
#[derive(Debug)]
pub struct EventBus {
    sender: BroadcastSender<FleetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event to every current subscriber. It is not an error for
    /// there to be no subscribers at all.
    pub fn publish(&self, event: FleetEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!("published {:?} with no active subscribers", event);
        }
    }

    /// Registers a new sink. Sinks are expected to drain their receiver in a
    /// tight, non-blocking loop; a sink that performs blocking work per event
    /// should hand off to its own worker task instead of doing it inline.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A sink that folds fleet events into the Prometheus gauges/counters in
/// [`crate::core::metrics`]. Runs until its channel closes or it starts
/// lagging too far behind to keep up, at which point events are shed and
/// counted rather than the task blocking the bus.
pub async fn run_metrics_sink(mut rx: broadcast::Receiver<FleetEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => metrics::record_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                metrics::EVENTS_SHED_TOTAL.inc_by(n as f64);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.publish(FleetEvent::ServerReady { instance_id: 1 });
    }

    #[tokio::test]
    async fn subscriber_observes_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(FleetEvent::ServerOffline { instance_id: 7 });
        let event = rx.recv().await.unwrap();
        assert_eq!(event, FleetEvent::ServerOffline { instance_id: 7 });
    }

    #[tokio::test]
    async fn per_instance_ordering_is_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(FleetEvent::ServerReady { instance_id: 2 });
        bus.publish(FleetEvent::ServerOccupied { instance_id: 2 });
        bus.publish(FleetEvent::ServerOffline { instance_id: 2 });

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                FleetEvent::ServerReady { instance_id: 2 },
                FleetEvent::ServerOccupied { instance_id: 2 },
                FleetEvent::ServerOffline { instance_id: 2 },
            ]
        );
    }
}
