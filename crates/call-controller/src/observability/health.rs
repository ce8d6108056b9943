//! Health endpoints for the Call Controller.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (can this server route rooms?)
//!
//! The `/metrics` endpoint is merged in by the binary from the Prometheus
//! exporter handle.
//!
//! # Health State
//!
//! - `live`: true from startup until the process exits
//! - `ready`: true once the first heartbeat is in the store, so other servers
//!   treat this one as live and the reaper leaves its rooms alone. Cleared
//!   again at the start of shutdown, before peers and rooms are released.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    /// Set by the heartbeat task, cleared by shutdown.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Mark the server as visible to the fleet.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the server as leaving the fleet.
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Create the health router with liveness and readiness endpoints.
///
/// # Endpoints
///
/// - `GET /health` - 200 while the process runs
/// - `GET /ready` - 200 after the first heartbeat, 503 before it and during
///   shutdown
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

/// Liveness probe handler.
async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness probe handler.
///
/// Load balancers should stop sending joins here as soon as this turns 503;
/// the server is about to remove its own peers.
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tasks::start_heartbeat;
    use axum::body::Body;
    use axum::http::Request;
    use common::types::ServerId;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn status(app: &Router, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        app.clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready before a heartbeat");
    }

    #[tokio::test]
    async fn test_readiness_handler_follows_state() {
        let state = Arc::new(HealthState::new());
        assert_eq!(
            readiness_handler(State(Arc::clone(&state))).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        state.set_ready();
        assert_eq!(readiness_handler(State(Arc::clone(&state))).await, StatusCode::OK);
        state.set_not_ready();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_first_heartbeat_until_shutdown() {
        let state = Arc::new(HealthState::new());
        let app = health_router(Arc::clone(&state));
        assert_eq!(status(&app, "/ready").await, StatusCode::SERVICE_UNAVAILABLE);

        let token = CancellationToken::new();
        let heartbeat = tokio::spawn(start_heartbeat(
            Arc::new(MemoryStore::new()),
            ServerId::from("cc-1"),
            Duration::from_secs(15),
            Arc::clone(&state),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(status(&app, "/ready").await, StatusCode::OK);
        assert_eq!(status(&app, "/health").await, StatusCode::OK);

        // Shutdown clears readiness; liveness stays until exit.
        token.cancel();
        heartbeat.await.unwrap();
        state.set_not_ready();
        assert_eq!(status(&app, "/ready").await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(&app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let app = health_router(Arc::new(HealthState::new()));
        assert_eq!(status(&app, "/rooms").await, StatusCode::NOT_FOUND);
    }
}
