//! Metrics definitions for the Call Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cc_` prefix for Call Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded enums:
//! - `initial_state`: 3 values (active, muted, deafened)
//! - `outcome`: 2 values (deleted, migrated)
//! - `step`: 5 values (transport, connect, produce, consume, resume)
//! - `status`: 2 values (ok, error)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Lock waits are usually sub-millisecond, but contention under a
        // stale lease can last the whole preempt timeout.
        .set_buckets_for_metric(
            Matcher::Full("cc_lock_wait_seconds".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000, 20.000,
            ],
        )
        .map_err(|e| format!("Failed to set lock wait buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Set the number of rooms routed by this process.
///
/// Metric: `cc_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_rooms_active").set(count as f64);
}

/// Record a peer join.
///
/// Metric: `cc_peer_joins_total`
/// Labels: `initial_state`
pub fn record_peer_join(initial_state: &'static str) {
    counter!("cc_peer_joins_total", "initial_state" => initial_state).increment(1);
}

/// Record a peer leave.
///
/// Metric: `cc_peer_leaves_total`
pub fn record_peer_leave() {
    counter!("cc_peer_leaves_total").increment(1);
}

/// Record time spent waiting for a lock.
///
/// Metric: `cc_lock_wait_seconds`
pub fn record_lock_wait(duration: Duration) {
    histogram!("cc_lock_wait_seconds").record(duration.as_secs_f64());
}

/// Record a stale lock being reclaimed.
///
/// Metric: `cc_lock_reclaimed_total`
pub fn record_lock_reclaimed() {
    counter!("cc_lock_reclaimed_total").increment(1);
}

/// Record peers removed by the reaper.
///
/// Metric: `cc_reaped_peers_total`
pub fn record_reaped_peers(count: usize) {
    counter!("cc_reaped_peers_total").increment(count as u64);
}

/// Record a room handled by the reaper.
///
/// Metric: `cc_reaped_rooms_total`
/// Labels: `outcome` (deleted, migrated)
pub fn record_reaped_room(outcome: &'static str) {
    counter!("cc_reaped_rooms_total", "outcome" => outcome).increment(1);
}

/// Record one negotiation step on the routing server.
///
/// Metric: `cc_negotiation_steps_total`
/// Labels: `step`, `status`
pub fn record_negotiation_step(step: &'static str, status: &'static str) {
    counter!("cc_negotiation_steps_total", "step" => step, "status" => status).increment(1);
}

/// Record a remote mute.
///
/// Metric: `cc_remote_mutes_total`
pub fn record_remote_mute() {
    counter!("cc_remote_mutes_total").increment(1);
}
