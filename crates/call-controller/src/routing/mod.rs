//! Media routing ownership.
//!
//! `RoutingController` (one per process) watches Rooms and keeps exactly one
//! [`RoomRouter`] running for every Room whose `routed_server` is the local
//! server. Only those routers talk to the SFU.

pub mod room;

pub use room::{RoomRouter, RoomRouterHandle};

use crate::observability::metrics;
use crate::sfu::SfuClient;
use crate::store::{DocumentStore, Filter};
use call_protocol::{Change, Collection, Record, Room};
use common::types::ServerId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

enum RoutingMessage {
    /// Calls this process currently routes.
    ActiveCalls {
        respond_to: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to the routing controller actor.
#[derive(Clone)]
pub struct RoutingControllerHandle {
    sender: mpsc::Sender<RoutingMessage>,
    cancel_token: CancellationToken,
}

impl RoutingControllerHandle {
    /// Calls with a running router on this process.
    pub async fn active_calls(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RoutingMessage::ActiveCalls { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop every router. Used on shutdown.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Owns the `RoomRouter`s of the local server.
pub struct RoutingController {
    server: ServerId,
    store: Arc<dyn DocumentStore>,
    sfu: Arc<dyn SfuClient>,
    receiver: mpsc::Receiver<RoutingMessage>,
    cancel_token: CancellationToken,
    /// Keyed by Room document id.
    routers: HashMap<String, RoomRouterHandle>,
}

impl RoutingController {
    /// Spawn the controller. The returned join handle completes once every
    /// router has closed its SFU objects.
    #[must_use]
    pub fn spawn(
        server: ServerId,
        store: Arc<dyn DocumentStore>,
        sfu: Arc<dyn SfuClient>,
        cancel_token: CancellationToken,
    ) -> (RoutingControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(16);
        let controller = RoutingController {
            server,
            store,
            sfu,
            receiver,
            cancel_token: cancel_token.clone(),
            routers: HashMap::new(),
        };
        let task = tokio::spawn(controller.run());
        (
            RoutingControllerHandle {
                sender,
                cancel_token,
            },
            task,
        )
    }

    #[instrument(skip_all, name = "cc.routing", fields(server = %self.server))]
    async fn run(mut self) {
        let (snapshot, mut feed) = match self
            .store
            .watch(Filter::collection(Collection::Rooms))
            .await
        {
            Ok(watch) => watch,
            Err(e) => {
                error!(target: "cc.routing", error = %e, "Failed to watch rooms");
                return;
            }
        };

        for record in snapshot {
            self.on_change(Change::Added(record));
        }

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                message = self.receiver.recv() => {
                    match message {
                        Some(RoutingMessage::ActiveCalls { respond_to }) => {
                            let calls = self
                                .routers
                                .values()
                                .map(|r| r.call().to_string())
                                .collect();
                            let _ = respond_to.send(calls);
                        }
                        None => break,
                    }
                }
                change = feed.recv() => {
                    match change {
                        Some(change) => self.on_change(change),
                        None => {
                            warn!(target: "cc.routing", "Room feed closed");
                            break;
                        }
                    }
                }
            }
        }

        let routers: Vec<RoomRouterHandle> = self.routers.drain().map(|(_, r)| r).collect();
        for router in routers {
            router.stop().await;
        }
        metrics::set_rooms_active(0);
        info!(target: "cc.routing", "Routing controller stopped");
    }

    fn on_change(&mut self, change: Change) {
        let removed = change.is_removed();
        let Record::Room(room) = change.into_record() else {
            return;
        };

        let owned = !removed && room.routed_server == self.server;
        if owned {
            if !self.routers.contains_key(&room.meta.id) {
                self.start_router(room);
            }
        } else if let Some(router) = self.routers.remove(&room.meta.id) {
            debug!(target: "cc.routing", call = %room.call, "Room no longer routed here");
            // Stopping awaits SFU cleanup; do not block the feed on it.
            tokio::spawn(router.stop());
        }
        metrics::set_rooms_active(self.routers.len());
    }

    fn start_router(&mut self, room: Room) {
        info!(target: "cc.routing", call = %room.call, room = %room.meta.id, "Routing room");
        let id = room.meta.id.clone();
        let handle = RoomRouter::spawn(
            room,
            self.server.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.sfu),
            self.cancel_token.child_token(),
        );
        self.routers.insert(id, handle);
    }
}
