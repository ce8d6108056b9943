//! Call End-to-End Test Harness
//!
//! Runs real `CallService` instances ("servers") against one shared
//! in-memory store, each with its own in-process SFU, and connects real
//! `call-client` sessions to them through a loopback channel. Nothing
//! crosses a socket; everything else is the production code path.
//!
//! # Modules
//!
//! - [`fleet`] - `TestFleet` / `TestCallServer`: servers sharing a store
//! - [`loopback`] - `LoopbackChannel`: the client's channel, bound to a server
//! - [`eventual`] - Polling assertions for reactive outcomes
//!
//! # Usage
//!
//! ```bash
//! cargo test -p call-e2e-tests
//! ```

pub mod eventual;
pub mod fleet;
pub mod loopback;

pub use eventual::{assert_eventually, snapshot_eventually, Settle};
pub use fleet::{TestCallServer, TestFleet, TestParticipant, HUNT};
pub use loopback::LoopbackChannel;
