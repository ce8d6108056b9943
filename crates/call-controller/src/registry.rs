//! Room and Peer lifecycle.
//!
//! Every decision about whether a Room exists, and who routes it, is made
//! under `room:<call>` and re-reads the store inside the lock.

use crate::errors::CallError;
use crate::locks::{room_lock_name, LockManager};
use crate::mute_policy::{self, InitialState};
use crate::observability::metrics;
use crate::repositories;
use crate::store::{DocumentStore, DocumentStoreExt, StoreError};
use call_protocol::{DocMeta, JoinRequest, Peer, Room};
use common::types::{ServerId, UserId};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Attempts to insert a Peer when a concurrent writer keeps taking its key.
const MAX_PEER_INSERT_ATTEMPTS: usize = 3;

/// Result of a join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub peer: Peer,
    pub room: Room,
    /// Whether this join created the Room.
    pub room_created: bool,
    /// Whether a previous Peer for the same tab was replaced.
    pub replaced_prior: bool,
    pub initial: InitialState,
}

/// Result of a leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Whether the Peer was still live.
    pub peer_removed: bool,
    /// Whether the Room was deleted because no Peer remained.
    pub room_removed: bool,
}

/// Room/Peer registry for one server process.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn DocumentStore>,
    locks: LockManager,
    server: ServerId,
    crowd_threshold: usize,
}

impl Registry {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: LockManager,
        server: ServerId,
        crowd_threshold: usize,
    ) -> Self {
        Self {
            store,
            locks,
            server,
            crowd_threshold,
        }
    }

    /// Attach a client session to a call.
    ///
    /// Creates the Room (routed here) if absent and replaces any still-live
    /// Peer for the same (hunt, call, tab).
    ///
    /// # Errors
    ///
    /// Returns store or lock errors.
    #[instrument(skip_all, name = "cc.registry.join", fields(call = %request.call, tab = %request.tab))]
    pub async fn join(&self, user: &UserId, request: &JoinRequest) -> Result<JoinOutcome, CallError> {
        let store = self.store.as_ref();

        let outcome = self
            .locks
            .with_lock(&room_lock_name(&request.call), || async {
                let (room, room_created) = match repositories::find_room(store, &request.call).await? {
                    Some(room) => (room, false),
                    None => {
                        let room = store
                            .insert_doc(Room {
                                meta: DocMeta::new(user),
                                hunt: request.hunt.clone(),
                                call: request.call.clone(),
                                routed_server: self.server.clone(),
                            })
                            .await?;
                        info!(
                            target: "cc.registry",
                            call = %room.call,
                            routed_server = %room.routed_server,
                            "Room created"
                        );
                        (room, true)
                    }
                };

                let prior =
                    repositories::peer_for_tab(store, &request.hunt, &request.call, &request.tab)
                        .await?;
                if let Some(prior) = &prior {
                    debug!(
                        target: "cc.registry",
                        prior_peer = %prior.meta.id,
                        "Replacing prior peer for the same tab"
                    );
                    repositories::remove_peer_cascade(store, prior).await?;
                }

                let existing = repositories::peers_in_call(store, &request.call).await?.len();
                let initial = mute_policy::initial_state(
                    request.desired,
                    prior.as_ref(),
                    existing,
                    self.crowd_threshold,
                );

                let peer = self.insert_peer(user, request, &initial).await?;

                Ok(JoinOutcome {
                    peer,
                    room,
                    room_created,
                    replaced_prior: prior.is_some(),
                    initial,
                })
            })
            .await?;

        if let Err(e) =
            repositories::touch_call_history(store, &request.hunt, &request.call, user).await
        {
            warn!(target: "cc.registry", error = %e, "Failed to record call activity");
        }

        metrics::record_peer_join(outcome.initial.peer_state().as_str());
        info!(
            target: "cc.registry",
            peer = %outcome.peer.meta.id,
            initial_state = outcome.initial.peer_state().as_str(),
            source = outcome.initial.source.as_str(),
            "Peer joined"
        );
        Ok(outcome)
    }

    async fn insert_peer(
        &self,
        user: &UserId,
        request: &JoinRequest,
        initial: &InitialState,
    ) -> Result<Peer, CallError> {
        let store = self.store.as_ref();
        for _ in 0..MAX_PEER_INSERT_ATTEMPTS {
            let candidate = Peer {
                meta: DocMeta::new(user),
                created_server: self.server.clone(),
                hunt: request.hunt.clone(),
                call: request.call.clone(),
                tab: request.tab.clone(),
                initial_peer_state: initial.peer_state(),
                remote_muted_by: initial.remote_muted_by.clone(),
                muted: initial.bits.muted,
                deafened: initial.bits.deafened,
            };
            match store.insert_doc(candidate).await {
                Ok(peer) => return Ok(peer),
                Err(StoreError::DuplicateKey { .. }) => {
                    // A racing reconnect for the same tab got in first.
                    if let Some(other) = repositories::peer_for_tab(
                        store,
                        &request.hunt,
                        &request.call,
                        &request.tab,
                    )
                    .await?
                    {
                        repositories::remove_peer_cascade(store, &other).await?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CallError::Internal(format!(
            "could not claim peer slot for tab {}",
            request.tab
        )))
    }

    /// Detach a Peer. Deletes the Room when no Peer remains for the call.
    ///
    /// Idempotent: leaving an already-removed peer still checks the Room.
    ///
    /// # Errors
    ///
    /// Returns store or lock errors.
    #[instrument(skip_all, name = "cc.registry.leave", fields(call = %peer.call, peer = %peer.meta.id))]
    pub async fn leave(&self, peer: &Peer) -> Result<LeaveOutcome, CallError> {
        let store = self.store.as_ref();
        let peer_removed = repositories::remove_peer_cascade(store, peer).await?;

        let room_removed = self
            .locks
            .with_lock(&room_lock_name(&peer.call), || async {
                if !repositories::peers_in_call(store, &peer.call).await?.is_empty() {
                    return Ok(false);
                }
                match repositories::find_room(store, &peer.call).await? {
                    Some(room) => Ok(store.remove_doc::<Room>(&room.meta.id).await?.is_some()),
                    None => Ok(false),
                }
            })
            .await?;

        if let Err(e) =
            repositories::touch_call_history(store, &peer.hunt, &peer.call, peer.user()).await
        {
            warn!(target: "cc.registry", error = %e, "Failed to record call activity");
        }

        if peer_removed {
            metrics::record_peer_leave();
        }
        info!(target: "cc.registry", peer_removed, room_removed, "Peer left");
        Ok(LeaveOutcome {
            peer_removed,
            room_removed,
        })
    }

    #[must_use]
    pub fn server(&self) -> &ServerId {
        &self.server
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }
}
