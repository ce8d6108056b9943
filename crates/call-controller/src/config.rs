//! Call Controller configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default; invalid values are rejected rather than silently defaulted.

use common::types::ServerId;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default server id prefix. The full id is `cc-<uuid>`.
pub const DEFAULT_SERVER_ID_PREFIX: &str = "cc";

/// Default participant count at or above which new joiners start muted.
pub const DEFAULT_CROWD_THRESHOLD: usize = 7;

/// Default age after which an unrenewed lock may be reclaimed.
pub const DEFAULT_LOCK_PREEMPT_SECONDS: u64 = 10;

/// Default lock renewal interval while held.
pub const DEFAULT_LOCK_RENEW_MILLIS: u64 = 2000;

/// Default server heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 15;

/// Default heartbeat age after which a server is considered dead.
pub const DEFAULT_SERVER_TIMEOUT_SECONDS: u64 = 60;

/// Default reaper interval.
pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 30;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// Call Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Identity of this process, threaded through every routing decision.
    pub server_id: ServerId,

    /// Whether calls are enabled at all.
    pub enabled: bool,

    /// Crowd threshold for the initial mute decision (default: 7).
    pub crowd_threshold: usize,

    /// Lock preemption timeout (default: 10s).
    pub lock_preempt: Duration,

    /// Lock renewal interval (default: 2s).
    pub lock_renew: Duration,

    /// Server heartbeat interval (default: 15s).
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which a server is dead (default: 60s).
    pub server_timeout: Duration,

    /// Reaper interval (default: 30s).
    pub gc_interval: Duration,

    /// Health endpoint bind address (default: "0.0.0.0:8082").
    pub health_bind_address: String,

    /// Emit JSON logs.
    pub log_json: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_id", &self.server_id.as_str())
            .field("enabled", &self.enabled)
            .field("crowd_threshold", &self.crowd_threshold)
            .field("lock_preempt_ms", &self.lock_preempt.as_millis())
            .field("lock_renew_ms", &self.lock_renew.as_millis())
            .field("heartbeat_interval_ms", &self.heartbeat_interval.as_millis())
            .field("server_timeout_ms", &self.server_timeout.as_millis())
            .field("gc_interval_ms", &self.gc_interval.as_millis())
            .field("health_bind_address", &self.health_bind_address)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{name} must be a valid value, got {raw:?}"))
        }),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any variable fails to parse or
    /// violates a constraint.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any variable fails to parse or
    /// violates a constraint.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let server_id = match vars.get("CALL_SERVER_ID") {
            Some(raw) => ServerId::parse(raw.clone())
                .map_err(|e| ConfigError::InvalidValue(format!("CALL_SERVER_ID: {e}")))?,
            None => ServerId::generate(DEFAULT_SERVER_ID_PREFIX),
        };

        let enabled = parse_var(vars, "CALL_ENABLED", true)?;
        let log_json = parse_var(vars, "CALL_LOG_JSON", false)?;

        let crowd_threshold = parse_var(vars, "CALL_CROWD_THRESHOLD", DEFAULT_CROWD_THRESHOLD)?;
        if crowd_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "CALL_CROWD_THRESHOLD must be at least 1".to_string(),
            ));
        }

        let lock_preempt = Duration::from_secs(parse_var(
            vars,
            "CALL_LOCK_PREEMPT_SECONDS",
            DEFAULT_LOCK_PREEMPT_SECONDS,
        )?);
        let lock_renew = Duration::from_millis(parse_var(
            vars,
            "CALL_LOCK_RENEW_MILLIS",
            DEFAULT_LOCK_RENEW_MILLIS,
        )?);
        if lock_renew.is_zero() || lock_renew >= lock_preempt {
            return Err(ConfigError::InvalidValue(format!(
                "CALL_LOCK_RENEW_MILLIS ({}) must be non-zero and shorter than the preempt timeout ({}s)",
                lock_renew.as_millis(),
                lock_preempt.as_secs()
            )));
        }

        let heartbeat_interval = Duration::from_secs(parse_var(
            vars,
            "CALL_HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?);
        let server_timeout = Duration::from_secs(parse_var(
            vars,
            "CALL_SERVER_TIMEOUT_SECONDS",
            DEFAULT_SERVER_TIMEOUT_SECONDS,
        )?);
        if heartbeat_interval.is_zero() || server_timeout <= heartbeat_interval {
            return Err(ConfigError::InvalidValue(
                "CALL_SERVER_TIMEOUT_SECONDS must exceed a non-zero heartbeat interval".to_string(),
            ));
        }

        let gc_interval = Duration::from_secs(parse_var(
            vars,
            "CALL_GC_INTERVAL_SECONDS",
            DEFAULT_GC_INTERVAL_SECONDS,
        )?);
        if gc_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "CALL_GC_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }

        let health_bind_address = vars
            .get("CALL_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        Ok(Config {
            server_id,
            enabled,
            crowd_threshold,
            lock_preempt,
            lock_renew,
            heartbeat_interval,
            server_timeout,
            gc_interval,
            health_bind_address,
            log_json,
        })
    }

    /// Defaults with an explicit server id.
    #[must_use]
    pub fn for_server(server_id: ServerId) -> Self {
        Config {
            server_id,
            enabled: true,
            crowd_threshold: DEFAULT_CROWD_THRESHOLD,
            lock_preempt: Duration::from_secs(DEFAULT_LOCK_PREEMPT_SECONDS),
            lock_renew: Duration::from_millis(DEFAULT_LOCK_RENEW_MILLIS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECONDS),
            server_timeout: Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECONDS),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS),
            health_bind_address: DEFAULT_HEALTH_BIND_ADDRESS.to_string(),
            log_json: false,
        }
    }
}
