//! Tracing subscriber initialization.

use crate::config::ObservabilityConfig;
use crate::error::CommonError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.default_filter`.
///
/// # Errors
///
/// Returns `CommonError::Logging` if a global subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), CommonError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
    .map_err(|e| CommonError::Logging(e.to_string()))
}
