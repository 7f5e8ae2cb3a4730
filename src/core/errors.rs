// src/core/errors.rs

//! The primary error type shared across the fleet manager's core components.

use thiserror::Error;

/// All recoverable and fatal failure modes the core can produce.
///
/// Variants are grouped loosely by the taxonomy in the design notes: config
/// errors are fatal at startup, protocol/operation errors are returned to
/// callers, transport errors are handled by reconnect loops and never
/// propagated directly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("instance {0} not found")]
    UnknownInstance(u32),

    #[error("instance {0} already has a bound control session")]
    SessionAlreadyBound(u32),

    #[error("instance {0} has no bound control session")]
    NotConnected(u32),

    #[error("failed to launch child process: {0}")]
    LaunchFailed(String),

    #[error("process did not announce within the startup timeout")]
    AnnounceTimeout,

    #[error("protocol error on control channel: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("scaling error: {0}")]
    Scaling(String),

    #[error("master authentication failed: {0}")]
    AuthFailed(String),

    #[error("master authentication is required before the chat handshake may proceed")]
    NotAuthenticated,

    #[error("chat transport error: {0}")]
    ChatTransport(String),
}

impl From<std::io::Error> for FleetError {
    fn from(e: std::io::Error) -> Self {
        FleetError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(e: reqwest::Error) -> Self {
        FleetError::AuthFailed(e.to_string())
    }
}

/// Convenience result alias used throughout the core.
pub type FleetResult<T> = Result<T, FleetError>;
