// src/core/control/session.rs

//! Per-connection control-session state (§3 "Control session").

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;

use futures::SinkExt;

use super::codec::ControlCodec;
use super::frame::OutboundFrame;
use crate::core::errors::{FleetError, FleetResult};

/// Bound on how long an out-of-band write may stall before the session is
/// considered dead (§4.5 backpressure & timeouts).
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// State tracked for a single accepted TCP connection from a child process.
///
/// The write half is guarded by whatever lock wraps this struct (callers
/// share it as `Arc<tokio::sync::Mutex<ControlSession>>>`); the registry only
/// ever holds a `Weak` reference so ownership stays with the listener.
pub struct ControlSession {
    pub peer_addr: SocketAddr,
    /// Set the moment the `0x40` announce frame is processed; `None` before
    /// that (a session with no instance id bound yet must not receive any
    /// other frame per the session protocol invariant, §4.5).
    pub instance_id: Option<u32>,
    pub last_activity: Instant,
    writer: FramedWrite<WriteHalf<TcpStream>, ControlCodec>,
}

impl ControlSession {
    pub fn new(peer_addr: SocketAddr, write_half: WriteHalf<TcpStream>) -> Self {
        Self {
            peer_addr,
            instance_id: None,
            last_activity: Instant::now(),
            writer: FramedWrite::new(write_half, ControlCodec),
        }
    }

    pub fn bind(&mut self, instance_id: u32) {
        self.instance_id = Some(instance_id);
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Sends an out-of-band frame (`0x22`/`0x24`/`0x25`), acquiring the
    /// implicit write lock held by the caller's `Mutex` wrapper. A stalled
    /// write past `WRITE_TIMEOUT` is treated as a dead session.
    pub async fn send(&mut self, frame: OutboundFrame) -> FleetResult<()> {
        timeout(WRITE_TIMEOUT, self.writer.send(frame))
            .await
            .map_err(|_| FleetError::Protocol("control session write timed out".into()))?
            .map_err(|e| FleetError::Protocol(format!("control session write failed: {e}")))
    }
}
