//! Background tasks for the Call Controller.
//!
//! # Tasks
//!
//! - `heartbeat` - Keeps this server's `ServerRecord` fresh
//! - `reaper` - Repairs Peers and Rooms left behind by dead servers

pub mod heartbeat;
pub mod reaper;

pub use heartbeat::{start_heartbeat, write_heartbeat};
pub use reaper::{run_reap, start_reaper, ReapReport};
