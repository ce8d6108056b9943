//! Server heartbeat background task.
//!
//! Upserts this server's `ServerRecord` on every tick. The reaper on any
//! server treats a record older than the server timeout as a dead process.
//!
//! # Graceful Shutdown
//!
//! The task exits when its cancellation token is cancelled. The record is
//! left in place; `CallService::shutdown` deletes it.

use crate::errors::CallError;
use crate::observability::HealthState;
use crate::repositories::{self, system_user};
use crate::store::{DocumentStore, DocumentStoreExt, StoreError};
use call_protocol::{DocMeta, ServerRecord};
use common::types::ServerId;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Write (or refresh) the heartbeat record of `server`.
///
/// # Errors
///
/// Returns store errors other than lost races.
pub async fn write_heartbeat(store: &dyn DocumentStore, server: &ServerId) -> Result<(), CallError> {
    for _ in 0..3 {
        let result = match repositories::server_record(store, server).await? {
            Some(record) => store.replace_doc(record).await.map(|_| ()),
            None => store
                .insert_doc(ServerRecord {
                    meta: DocMeta::new(&system_user(server)),
                    server: server.clone(),
                    hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
                    pid: std::process::id(),
                })
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(StoreError::Stale { .. } | StoreError::DuplicateKey { .. } | StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Err(CallError::Internal(format!("contention writing heartbeat of {server}")))
}

/// Start the heartbeat background task.
///
/// Marks `health` ready after the first successful write.
#[instrument(skip_all, name = "cc.task.heartbeat", fields(server = %server))]
pub async fn start_heartbeat(
    store: Arc<dyn DocumentStore>,
    server: ServerId,
    interval: Duration,
    health: Arc<HealthState>,
    cancel_token: CancellationToken,
) {
    info!(
        target: "cc.task.heartbeat",
        interval_ms = interval.as_millis(),
        "Starting heartbeat task"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match write_heartbeat(store.as_ref(), &server).await {
                    Ok(()) => {
                        debug!(target: "cc.task.heartbeat", "Heartbeat written");
                        if !health.is_ready() && !cancel_token.is_cancelled() {
                            health.set_ready();
                        }
                    }
                    Err(e) => {
                        error!(target: "cc.task.heartbeat", error = %e, "Failed to write heartbeat");
                    }
                }
            }
            () = cancel_token.cancelled() => {
                info!(target: "cc.task.heartbeat", "Heartbeat task received shutdown signal, exiting");
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_write_heartbeat_upserts() {
        let store = MemoryStore::new();
        let server = ServerId::from("cc-1");

        write_heartbeat(&store, &server).await.unwrap();
        let first = repositories::server_record(&store, &server).await.unwrap().unwrap();
        assert_eq!(first.pid, std::process::id());

        write_heartbeat(&store, &server).await.unwrap();
        let servers = repositories::all_servers(&store).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].meta.updated_at > first.meta.updated_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_task_sets_ready_and_refreshes() {
        let store = MemoryStore::new();
        let health = Arc::new(HealthState::new());
        let token = CancellationToken::new();
        let task = tokio::spawn(start_heartbeat(
            Arc::new(store.clone()),
            ServerId::from("cc-1"),
            Duration::from_secs(15),
            Arc::clone(&health),
            token.clone(),
        ));

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(health.is_ready());
        let first = repositories::server_record(&store, &ServerId::from("cc-1"))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        let later = repositories::server_record(&store, &ServerId::from("cc-1"))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.meta.updated_at, later.meta.updated_at);

        token.cancel();
        task.await.unwrap();
    }
}
