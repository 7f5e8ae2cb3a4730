// src/core/control/mod.rs

//! The manager control channel (C5): a length-framed TCP protocol children
//! open back to the manager to announce themselves, stream status, and
//! receive out-of-band commands.

pub mod codec;
pub mod frame;
pub mod listener;
pub mod session;

pub use codec::ControlCodec;
pub use frame::{ControlFrame, OutboundFrame, StatusFrame};
pub use listener::{run_listener, ControlPlane};
pub use session::ControlSession;
