//! Reaper background task.
//!
//! Repairs registry state left behind by servers that died without a clean
//! shutdown:
//! 1. Deletes every Peer created by a dead server (with its negotiation records)
//! 2. For every Room routed by a dead server, under `room:<call>`: deletes it
//!    and, if Peers on live servers remain, creates a replacement Room routed
//!    to the reaping server
//! 3. Deletes the dead servers' heartbeat records
//! 4. Forgets records soft-deleted more than one server timeout ago
//!
//! A server is dead when its heartbeat is older than the server timeout, or
//! when a Peer or Room names a server with no heartbeat at all. The reaping
//! server is never dead.

use crate::errors::CallError;
use crate::locks::{room_lock_name, LockManager};
use crate::observability::metrics;
use crate::repositories::{self, system_user};
use crate::store::{DocumentStore, DocumentStoreExt};
use call_protocol::{DocMeta, Room, ServerRecord};
use chrono::Utc;
use common::types::ServerId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Outcome of one reap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub dead_servers: Vec<ServerId>,
    pub peers_removed: usize,
    pub rooms_deleted: usize,
    pub rooms_migrated: usize,
    pub tombstones_purged: usize,
}

impl ReapReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dead_servers.is_empty()
            && self.peers_removed == 0
            && self.rooms_deleted == 0
            && self.rooms_migrated == 0
    }
}

/// Run a single reap pass as `local`.
///
/// # Errors
///
/// Returns store or lock errors. Work done before the error is kept; the
/// next pass picks up the rest.
#[instrument(skip_all, name = "cc.task.reaper.run", fields(server = %local))]
pub async fn run_reap(
    store: &dyn DocumentStore,
    locks: &LockManager,
    local: &ServerId,
    server_timeout: Duration,
) -> Result<ReapReport, CallError> {
    let timeout = chrono::Duration::from_std(server_timeout)
        .map_err(|e| CallError::Config(format!("server timeout out of range: {e}")))?;
    let now = Utc::now();

    let servers = repositories::all_servers(store).await?;
    let mut live: HashSet<ServerId> = servers
        .iter()
        .filter(|s| now - s.meta.updated_at < timeout)
        .map(|s| s.server.clone())
        .collect();
    live.insert(local.clone());

    let mut dead: HashSet<ServerId> = servers
        .iter()
        .filter(|s| !live.contains(&s.server))
        .map(|s| s.server.clone())
        .collect();

    let mut report = ReapReport::default();

    for peer in repositories::all_peers(store).await? {
        if live.contains(&peer.created_server) {
            continue;
        }
        dead.insert(peer.created_server.clone());
        if repositories::remove_peer_cascade(store, &peer).await? {
            report.peers_removed += 1;
        }
    }
    if report.peers_removed > 0 {
        metrics::record_reaped_peers(report.peers_removed);
    }

    for room in repositories::all_rooms(store).await? {
        if live.contains(&room.routed_server) {
            continue;
        }
        dead.insert(room.routed_server.clone());
        match reap_room(store, locks, local, &room, &live).await? {
            Some(true) => report.rooms_migrated += 1,
            Some(false) => report.rooms_deleted += 1,
            None => {}
        }
    }

    for record in servers.iter().filter(|s| dead.contains(&s.server)) {
        store.remove_doc::<ServerRecord>(&record.meta.id).await?;
    }

    report.tombstones_purged = store.purge_removed(now - timeout).await?;

    let mut dead: Vec<ServerId> = dead.into_iter().collect();
    dead.sort();
    report.dead_servers = dead;
    Ok(report)
}

/// Delete or migrate one Room routed by a dead server.
///
/// Returns `Some(true)` when migrated, `Some(false)` when deleted, and `None`
/// when someone else already repaired it.
async fn reap_room(
    store: &dyn DocumentStore,
    locks: &LockManager,
    local: &ServerId,
    stale: &Room,
    live: &HashSet<ServerId>,
) -> Result<Option<bool>, CallError> {
    locks
        .with_lock(&room_lock_name(&stale.call), || async {
            // Re-read inside the lock.
            let Some(room) = repositories::find_room(store, &stale.call).await? else {
                return Ok(None);
            };
            if room.meta.id != stale.meta.id || live.contains(&room.routed_server) {
                return Ok(None);
            }

            store.remove_doc::<Room>(&room.meta.id).await?;
            let remaining = repositories::peers_in_call(store, &room.call).await?;
            if remaining.is_empty() {
                info!(
                    target: "cc.task.reaper",
                    call = %room.call,
                    dead_server = %room.routed_server,
                    "Deleted room of dead server"
                );
                metrics::record_reaped_room("deleted");
                return Ok(Some(false));
            }

            let replacement = store
                .insert_doc(Room {
                    meta: DocMeta::new(&system_user(local)),
                    hunt: room.hunt.clone(),
                    call: room.call.clone(),
                    routed_server: local.clone(),
                })
                .await?;
            warn!(
                target: "cc.task.reaper",
                call = %replacement.call,
                dead_server = %room.routed_server,
                peers = remaining.len(),
                "Migrated room of dead server"
            );
            metrics::record_reaped_room("migrated");
            Ok(Some(true))
        })
        .await
}

/// Start the reaper background task.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "cc.task.reaper", fields(server = %local))]
pub async fn start_reaper(
    store: Arc<dyn DocumentStore>,
    locks: LockManager,
    local: ServerId,
    interval: Duration,
    server_timeout: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "cc.task.reaper",
        interval_ms = interval.as_millis(),
        server_timeout_ms = server_timeout.as_millis(),
        "Starting reaper task"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_reap(store.as_ref(), &locks, &local, server_timeout).await {
                    Ok(report) if !report.is_empty() => {
                        info!(
                            target: "cc.task.reaper",
                            dead_servers = report.dead_servers.len(),
                            peers_removed = report.peers_removed,
                            rooms_deleted = report.rooms_deleted,
                            rooms_migrated = report.rooms_migrated,
                            "Reaped dead servers"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(target: "cc.task.reaper", error = %e, "Reap pass failed");
                    }
                }
            }
            () = cancel_token.cancelled() => {
                info!(target: "cc.task.reaper", "Reaper task received shutdown signal, exiting");
                break;
            }
        }
    }
}
