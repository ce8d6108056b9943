//! Call Client Library
//!
//! Participant side of the audio-call subsystem.
//!
//! # Architecture
//!
//! - [`session`] - `CallSession`, the not-in-call / requesting-media /
//!   in-call state machine
//! - [`connection`] - `CallConnection`, the per-call negotiation actor
//! - [`mute`] - Reconciliation of local mute/deafen intent with the server
//! - [`media`] - Seams to the local media layer (capture, device, transports)
//! - [`channel`] - Client view of the reactive channel
//!
//! Every SFU id the client uses (transport, producer, consumer) is read from
//! a record the server wrote; the client never makes one up.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod connection;
pub mod errors;
pub mod media;
pub mod mute;
pub mod session;

#[cfg(test)]
mod testing;

pub use channel::{CallChannel, ChannelSubscription, SubscriptionGuard};
pub use connection::{CallConnection, ConnectionSnapshot, ConnectionStatus, TransportPhase};
pub use errors::ClientError;
pub use mute::{MuteAction, MuteReconciler};
pub use session::{ActiveCall, CallIdentity, CallPhase, CallSession, CallState};
