//! Common configuration types for the call subsystem.

use serde::{Deserialize, Serialize};

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub default_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl ObservabilityConfig {
    /// Build a config for the named crate at `debug` level.
    #[must_use]
    pub fn for_crate(crate_name: &str, json_logs: bool) -> Self {
        Self {
            default_filter: format!("{crate_name}=debug,tower_http=info"),
            json_logs,
        }
    }
}
