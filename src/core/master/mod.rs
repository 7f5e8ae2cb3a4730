// src/core/master/mod.rs

//! The master/chat client (C7): authenticates the host with the master
//! server, then maintains a long-lived chat handshake, re-announcing on
//! disconnect. Two sub-channels with independent state but a causal order
//! (authenticate first, then chat) driven by a single supervisor loop so
//! reconnects never stampede (§4.7).

mod auth;
mod chat;
mod ip;
mod supervisor;

pub use auth::{AuthResponse, authenticate};
pub use chat::ServerInfo;
pub use ip::discover_external_ip;
pub use supervisor::{AuthState, MasterClient};
