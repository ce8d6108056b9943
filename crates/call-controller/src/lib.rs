//! Call Controller Library
//!
//! Server side of the audio-call subsystem. A fleet of controller processes
//! shares one document store; each call's media routing is owned by exactly
//! one process, recorded on the call's Room.
//!
//! # Architecture
//!
//! - [`store`] - Shared document store seam and the in-memory implementation
//! - [`locks`] - Named, renewable leases serializing room-ownership decisions
//! - [`registry`] - Room and Peer lifecycle (join, leave)
//! - [`mute_policy`] - Initial mute state and remote-mute rules
//! - [`routing`] - Per-room router actors driving the SFU
//! - [`sfu`] - SFU client seam
//! - [`tasks`] - Heartbeat and reaper background tasks
//! - [`service`] - `CallService`, the server side of the reactive channel
//!
//! # Ownership
//!
//! Only the server named by `Room.routed_server` talks to the SFU for that
//! call. Every other server writes request records and waits for the owner
//! to write the matching ack.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod locks;
pub mod mute_policy;
pub mod observability;
pub mod registry;
pub mod repositories;
pub mod routing;
pub mod service;
pub mod sfu;
pub mod store;
pub mod tasks;
