//! `CallService` - server side of the reactive channel.
//!
//! One instance per controller process. It authorizes every command, turns
//! client intent into request records, and hands each joined client a
//! [`CallSubscription`]: the client-visible records of its call plus an
//! ordered feed of changes to them. The subscription owns the Peer; closing
//! or dropping it leaves the call exactly once.
//!
//! Background work (routing, heartbeat, reaper) is started by
//! [`CallService::start`] and stopped by [`CallService::shutdown`].

use crate::auth::Authorizer;
use crate::config::Config;
use crate::errors::CallError;
use crate::locks::{room_lock_name, LockConfig, LockManager};
use crate::mute_policy;
use crate::observability::{metrics, HealthState};
use crate::registry::{LeaveOutcome, Registry};
use crate::repositories;
use crate::routing::{RoutingController, RoutingControllerHandle};
use crate::sfu::SfuClient;
use crate::store::{DocumentStore, DocumentStoreExt, Filter, StoreError};
use crate::tasks;
use call_protocol::{
    Change, ChangeFeed, Collection, ConnectRequest, Consumer, ConsumerAck, DesiredPeerState,
    DocMeta, DtlsParameters, JoinRequest, MediaKind, Peer, PeerRemoteMute, ProducerClient, Record,
    Room, RtpCapabilities, RtpParameters, ServerRecord, Transport, TransportDirection,
    TransportRequest,
};
use common::types::{HuntId, PeerId, ServerId, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Server side of the call subsystem for one process.
#[derive(Clone)]
pub struct CallService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    store: Arc<dyn DocumentStore>,
    registry: Registry,
    authorizer: Arc<dyn Authorizer>,
    health: Arc<HealthState>,
    routing: RoutingControllerHandle,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// A joined client session.
///
/// `records` is the initial client-visible state of the call. `feed` carries
/// every later change to it, in store order.
pub struct CallSubscription {
    pub peer: Peer,
    pub records: Vec<Record>,
    pub feed: ChangeFeed,
    pub guard: LeaveGuard,
}

/// Owns a joined Peer. Leaves exactly once: on [`LeaveGuard::close`], or on
/// drop if never closed.
pub struct LeaveGuard {
    service: CallService,
    user: UserId,
    peer: Peer,
    forward: CancellationToken,
    closed: bool,
}

impl LeaveGuard {
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Leave the call and stop the feed.
    ///
    /// Dropping the returned future before it completes leaves the Peer to
    /// the guard's drop, as if `close` had never been called.
    ///
    /// # Errors
    ///
    /// Returns registry errors from the leave.
    pub async fn close(mut self) -> Result<LeaveOutcome, CallError> {
        self.forward.cancel();
        let outcome = self.service.leave_peer(&self.peer).await;
        self.closed = true;
        outcome
    }
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.forward.cancel();
        let service = self.service.clone();
        let peer = self.peer.clone();
        let user = self.user.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = service.leave_peer(&peer).await {
                        warn!(target: "cc.service", peer = %peer.meta.id, user = %user, error = %e, "Leave on drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(target: "cc.service", peer = %peer.meta.id, "Subscription dropped outside a runtime, peer left for the reaper");
            }
        }
    }
}

impl CallService {
    /// Write the first heartbeat and start routing, heartbeat and reaper.
    ///
    /// # Errors
    ///
    /// Returns store errors from the first heartbeat.
    #[instrument(skip_all, name = "cc.service.start", fields(server = %config.server_id))]
    pub async fn start(
        config: Config,
        store: Arc<dyn DocumentStore>,
        sfu: Arc<dyn SfuClient>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, CallError> {
        let server = config.server_id.clone();
        let locks = LockManager::new(
            Arc::clone(&store),
            &server,
            LockConfig {
                preempt: config.lock_preempt,
                renew: config.lock_renew,
            },
        );
        let registry = Registry::new(
            Arc::clone(&store),
            locks.clone(),
            server.clone(),
            config.crowd_threshold,
        );
        let health = Arc::new(HealthState::new());
        let cancel_token = CancellationToken::new();

        tasks::write_heartbeat(store.as_ref(), &server).await?;

        let (routing, routing_task) = RoutingController::spawn(
            server.clone(),
            Arc::clone(&store),
            sfu,
            cancel_token.child_token(),
        );
        let heartbeat_task = tokio::spawn(tasks::start_heartbeat(
            Arc::clone(&store),
            server.clone(),
            config.heartbeat_interval,
            Arc::clone(&health),
            cancel_token.child_token(),
        ));
        let reaper_task = tokio::spawn(tasks::start_reaper(
            Arc::clone(&store),
            locks,
            server.clone(),
            config.gc_interval,
            config.server_timeout,
            cancel_token.child_token(),
        ));

        info!(target: "cc.service", config = ?config, "Call service started");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry,
                authorizer,
                health,
                routing,
                cancel_token,
                tasks: Mutex::new(vec![routing_task, heartbeat_task, reaper_task]),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.inner.config.server_id
    }

    #[must_use]
    pub fn health(&self) -> Arc<HealthState> {
        Arc::clone(&self.inner.health)
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.inner.store)
    }

    /// Calls whose media this process currently routes.
    pub async fn routed_calls(&self) -> Vec<String> {
        self.inner.routing.active_calls().await
    }

    async fn authorize(&self, user: &UserId, hunt: &HuntId) -> Result<(), CallError> {
        if !self.inner.config.enabled {
            return Err(CallError::FeatureDisabled);
        }
        if !self.inner.authorizer.is_member(user, hunt).await? {
            debug!(target: "cc.service", user = %user, hunt = %hunt, "Not a member");
            return Err(CallError::NotAMember(hunt.to_string()));
        }
        Ok(())
    }

    /// Load a Peer the acting user created.
    async fn own_peer(&self, user: &UserId, peer: &PeerId) -> Result<Peer, CallError> {
        let peer = repositories::get_peer(self.inner.store.as_ref(), peer).await?;
        self.authorize(user, &peer.hunt).await?;
        if peer.user() != user {
            return Err(CallError::PermissionDenied(format!(
                "peer {} belongs to another user",
                peer.meta.id
            )));
        }
        Ok(peer)
    }

    /// Join a call and subscribe to its client-visible records.
    ///
    /// # Errors
    ///
    /// Returns authorization, store or lock errors.
    #[instrument(skip_all, name = "cc.service.join", fields(user = %user, call = %request.call, tab = %request.tab))]
    pub async fn join(&self, user: &UserId, request: JoinRequest) -> Result<CallSubscription, CallError> {
        self.authorize(user, &request.hunt).await?;
        let outcome = self.inner.registry.join(user, &request).await?;
        let peer = outcome.peer;
        let peer_id = peer.peer_id();

        let (snapshot, feed) = match self
            .inner
            .store
            .watch(Filter::collections(&Collection::CLIENT_VISIBLE).in_call(&request.call))
            .await
        {
            Ok(watch) => watch,
            Err(e) => {
                if let Err(leave_err) = self.leave_peer(&peer).await {
                    warn!(target: "cc.service", error = %leave_err, "Failed to undo join");
                }
                return Err(e.into());
            }
        };

        let records = snapshot
            .into_iter()
            .filter(|r| visible_to(r, &peer_id))
            .collect();
        let forward = self.inner.cancel_token.child_token();
        let (sender, client_feed) = mpsc::unbounded_channel();
        tokio::spawn(forward_visible(peer_id.clone(), feed, sender, forward.clone()));

        Ok(CallSubscription {
            peer: peer.clone(),
            records,
            feed: client_feed,
            guard: LeaveGuard {
                service: self.clone(),
                user: user.clone(),
                peer,
                forward,
                closed: false,
            },
        })
    }

    /// Idempotent: a Peer that is already gone still gets the room check,
    /// so an interrupted leave can be finished by running it again.
    async fn leave_peer(&self, peer: &Peer) -> Result<LeaveOutcome, CallError> {
        self.inner.registry.leave(peer).await
    }

    /// Leave a call.
    ///
    /// # Errors
    ///
    /// Returns authorization or registry errors.
    #[instrument(skip_all, name = "cc.service.leave", fields(user = %user, peer = %peer))]
    pub async fn leave(&self, user: &UserId, peer: &PeerId) -> Result<LeaveOutcome, CallError> {
        let peer = self.own_peer(user, peer).await?;
        self.inner.registry.leave(&peer).await
    }

    /// Ask the routing server for a send and a recv transport.
    ///
    /// # Errors
    ///
    /// Returns authorization or store errors.
    #[instrument(skip_all, name = "cc.service.request_transports", fields(user = %user, peer = %peer))]
    pub async fn request_transports(
        &self,
        user: &UserId,
        peer: &PeerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<TransportRequest, CallError> {
        let peer = self.own_peer(user, peer).await?;
        let request = self
            .inner
            .store
            .insert_doc(TransportRequest {
                meta: DocMeta::new(user),
                created_server: self.server_id().clone(),
                hunt: peer.hunt.clone(),
                call: peer.call.clone(),
                peer: peer.peer_id(),
                rtp_capabilities,
            })
            .await?;
        debug!(target: "cc.service", request = %request.meta.id, "Transport request created");
        Ok(request)
    }

    /// Withdraw a transport request and everything negotiated on it.
    ///
    /// # Errors
    ///
    /// Returns authorization or store errors.
    #[instrument(skip_all, name = "cc.service.release_transports", fields(user = %user, request = %request))]
    pub async fn release_transports(&self, user: &UserId, request: &str) -> Result<(), CallError> {
        let store = self.inner.store.as_ref();
        let Some(existing) = store.get_doc::<TransportRequest>(request).await? else {
            return Ok(());
        };
        let peer = self.own_peer(user, &existing.peer).await?;

        let negotiated = store
            .find(
                &Filter::collections(&[
                    Collection::ConnectRequests,
                    Collection::ProducerClients,
                ])
                .in_call(&peer.call)
                .for_peer(&existing.peer),
            )
            .await?;
        for record in negotiated {
            if repositories::transport_request_of(&record) == Some(request) {
                store.remove(record.collection(), record.id()).await?;
            }
        }
        store.remove_doc::<TransportRequest>(request).await?;
        Ok(())
    }

    /// Hand the client's DTLS parameters for a transport to the routing server.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the transport is not the peer's, `Conflict` if
    /// it already has a connect request.
    #[instrument(skip_all, name = "cc.service.connect_transport", fields(user = %user, peer = %peer, transport = %transport))]
    pub async fn connect_transport(
        &self,
        user: &UserId,
        peer: &PeerId,
        transport: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<ConnectRequest, CallError> {
        let peer = self.own_peer(user, peer).await?;
        let transport =
            repositories::get_required::<Transport>(self.inner.store.as_ref(), transport).await?;
        if transport.peer != peer.peer_id() {
            return Err(CallError::PermissionDenied(
                "transport belongs to another peer".to_string(),
            ));
        }

        let request = ConnectRequest {
            meta: DocMeta::new(user),
            created_server: self.server_id().clone(),
            hunt: peer.hunt.clone(),
            call: peer.call.clone(),
            peer: peer.peer_id(),
            transport_request: transport.transport_request.clone(),
            direction: transport.direction,
            transport: transport.meta.id.clone(),
            dtls_parameters,
        };
        match self.inner.store.insert_doc(request).await {
            Ok(request) => Ok(request),
            Err(StoreError::DuplicateKey { .. }) => Err(CallError::Conflict(
                "transport already has a connect request".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Declare a local track to publish on a send transport.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the transport is not the peer's send transport,
    /// `Conflict` if the track is already produced on it.
    #[instrument(skip_all, name = "cc.service.produce", fields(user = %user, peer = %peer, track = %track_id))]
    pub async fn produce(
        &self,
        user: &UserId,
        peer: &PeerId,
        transport: &str,
        track_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerClient, CallError> {
        let peer = self.own_peer(user, peer).await?;
        let transport =
            repositories::get_required::<Transport>(self.inner.store.as_ref(), transport).await?;
        if transport.peer != peer.peer_id() || transport.direction != TransportDirection::Send {
            return Err(CallError::PermissionDenied(
                "produce requires the peer's own send transport".to_string(),
            ));
        }

        let producer = ProducerClient {
            meta: DocMeta::new(user),
            created_server: self.server_id().clone(),
            hunt: peer.hunt.clone(),
            call: peer.call.clone(),
            peer: peer.peer_id(),
            transport_request: transport.transport_request.clone(),
            transport: transport.meta.id.clone(),
            track_id: track_id.to_string(),
            kind,
            rtp_parameters,
        };
        match self.inner.store.insert_doc(producer).await {
            Ok(producer) => Ok(producer),
            Err(StoreError::DuplicateKey { .. }) => Err(CallError::Conflict(format!(
                "track {track_id} is already produced"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop publishing a track.
    ///
    /// # Errors
    ///
    /// Returns authorization or store errors.
    #[instrument(skip_all, name = "cc.service.stop_producing", fields(user = %user, producer = %producer))]
    pub async fn stop_producing(&self, user: &UserId, producer: &str) -> Result<(), CallError> {
        let store = self.inner.store.as_ref();
        let Some(existing) = store.get_doc::<ProducerClient>(producer).await? else {
            return Ok(());
        };
        self.own_peer(user, &existing.peer).await?;
        store.remove_doc::<ProducerClient>(producer).await?;
        Ok(())
    }

    /// Confirm a consumer is set up locally. Idempotent.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the consumer belongs to another peer.
    #[instrument(skip_all, name = "cc.service.ack_consumer", fields(user = %user, peer = %peer, consumer = %consumer))]
    pub async fn ack_consumer(&self, user: &UserId, peer: &PeerId, consumer: &str) -> Result<(), CallError> {
        let peer = self.own_peer(user, peer).await?;
        let consumer =
            repositories::get_required::<Consumer>(self.inner.store.as_ref(), consumer).await?;
        if consumer.peer != peer.peer_id() {
            return Err(CallError::PermissionDenied(
                "consumer belongs to another peer".to_string(),
            ));
        }

        let ack = ConsumerAck {
            meta: DocMeta::new(user),
            hunt: peer.hunt.clone(),
            call: peer.call.clone(),
            peer: peer.peer_id(),
            consumer: consumer.meta.id.clone(),
        };
        match self.inner.store.insert_doc(ack).await {
            Ok(_) | Err(StoreError::DuplicateKey { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Update the peer's own mute/deafen bits.
    ///
    /// # Errors
    ///
    /// `RemoteMuted` if the update would unmute during a remote mute.
    #[instrument(skip_all, name = "cc.service.set_peer_state", fields(user = %user, peer = %peer, muted = desired.muted, deafened = desired.deafened))]
    pub async fn set_peer_state(
        &self,
        user: &UserId,
        peer: &PeerId,
        desired: DesiredPeerState,
    ) -> Result<Peer, CallError> {
        let peer = self.own_peer(user, peer).await?;
        repositories::update_doc(self.inner.store.as_ref(), &peer.meta.id, |p: &mut Peer| {
            if p.bits() == desired {
                return Ok(false);
            }
            mute_policy::apply_state_update(p, desired)?;
            Ok(true)
        })
        .await
    }

    /// Force-mute another member's peer.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when targeting oneself, `Conflict` when the target
    /// is already effectively muted.
    #[instrument(skip_all, name = "cc.service.remote_mute", fields(actor = %actor, peer = %peer))]
    pub async fn remote_mute(&self, actor: &UserId, peer: &PeerId) -> Result<Peer, CallError> {
        let target = repositories::get_peer(self.inner.store.as_ref(), peer).await?;
        self.authorize(actor, &target.hunt).await?;

        let updated = repositories::update_doc(
            self.inner.store.as_ref(),
            &target.meta.id,
            |p: &mut Peer| {
                mute_policy::apply_remote_mute(p, actor)?;
                Ok(true)
            },
        )
        .await?;

        self.inner
            .store
            .insert_doc(PeerRemoteMute {
                meta: DocMeta::new(actor),
                hunt: updated.hunt.clone(),
                call: updated.call.clone(),
                peer: updated.peer_id(),
                remote_muted_by: actor.clone(),
            })
            .await?;
        metrics::record_remote_mute();
        info!(target: "cc.service", "Peer remote muted");
        Ok(updated)
    }

    /// Acknowledge an outstanding remote mute. The peer stays muted.
    ///
    /// # Errors
    ///
    /// Returns authorization or store errors.
    #[instrument(skip_all, name = "cc.service.ack_remote_mute", fields(user = %user, peer = %peer))]
    pub async fn ack_remote_mute(&self, user: &UserId, peer: &PeerId) -> Result<Peer, CallError> {
        let peer = self.own_peer(user, peer).await?;
        repositories::update_doc(self.inner.store.as_ref(), &peer.meta.id, |p: &mut Peer| {
            Ok(mute_policy::apply_remote_mute_ack(p))
        })
        .await
    }

    /// Clean shutdown: stop routing, remove this server's Peers and the
    /// empty Rooms it routes, and drop the heartbeat record.
    ///
    /// Rooms routed here that still have Peers on other servers are left
    /// for the reaper to migrate.
    ///
    /// # Errors
    ///
    /// Returns the first store or lock error; remaining steps still run.
    #[instrument(skip_all, name = "cc.service.shutdown", fields(server = %self.server_id()))]
    pub async fn shutdown(&self) -> Result<(), CallError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(target: "cc.service", "Shutting down");
        self.inner.health.set_not_ready();
        self.inner.cancel_token.cancel();

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(target: "cc.service", error = %e, "Background task failed");
            }
        }

        let store = self.inner.store.as_ref();
        let server = self.server_id();
        let mut first_error = None;

        match repositories::all_peers(store).await {
            Ok(peers) => {
                for peer in peers.iter().filter(|p| &p.created_server == server) {
                    if let Err(e) = self.inner.registry.leave(peer).await {
                        warn!(target: "cc.service", peer = %peer.meta.id, error = %e, "Failed to remove peer");
                        first_error.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                first_error.get_or_insert(e.into());
            }
        }

        match repositories::all_rooms(store).await {
            Ok(rooms) => {
                for room in rooms.iter().filter(|r| &r.routed_server == server) {
                    if let Err(e) = self.release_room(room).await {
                        warn!(target: "cc.service", call = %room.call, error = %e, "Failed to release room");
                        first_error.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                first_error.get_or_insert(e.into());
            }
        }

        match repositories::server_record(store, server).await {
            Ok(Some(record)) => {
                if let Err(e) = store.remove_doc::<ServerRecord>(&record.meta.id).await {
                    first_error.get_or_insert(e.into());
                }
            }
            Ok(None) => {}
            Err(e) => {
                first_error.get_or_insert(e.into());
            }
        }

        info!(target: "cc.service", "Shutdown complete");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete a Room routed here if no Peer remains.
    async fn release_room(&self, stale: &Room) -> Result<(), CallError> {
        let store = self.inner.store.as_ref();
        let server = self.server_id();
        self.inner
            .registry
            .locks()
            .with_lock(&room_lock_name(&stale.call), || async {
                let Some(room) = repositories::find_room(store, &stale.call).await? else {
                    return Ok(());
                };
                if &room.routed_server != server
                    || !repositories::peers_in_call(store, &room.call).await?.is_empty()
                {
                    return Ok(());
                }
                store.remove_doc::<Room>(&room.meta.id).await?;
                debug!(target: "cc.service", call = %room.call, "Released room");
                Ok(())
            })
            .await
    }
}

/// Negotiation records are private to their peer; everything else in the
/// call is shared.
fn visible_to(record: &Record, peer: &PeerId) -> bool {
    record.owning_peer().map_or(true, |owner| owner == peer)
}

async fn forward_visible(
    peer: PeerId,
    mut feed: ChangeFeed,
    sender: mpsc::UnboundedSender<Change>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            change = feed.recv() => {
                let Some(change) = change else { break };
                if visible_to(change.record(), &peer) && sender.send(change).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::auth::StaticMembership;
    use crate::sfu::InProcessSfu;
    use crate::store::MemoryStore;
    use call_protocol::PeerState;
    use common::types::{CallId, TabId};
    use std::time::Duration;

    struct Fixture {
        store: MemoryStore,
        auth: StaticMembership,
        service: CallService,
    }

    async fn fixture_with(config: Config) -> Fixture {
        let store = MemoryStore::new();
        let auth = StaticMembership::new();
        for user in ["alice", "bob", "carol"] {
            auth.grant(&HuntId::from("h"), &UserId::from(user));
        }
        let service = CallService::start(
            config,
            Arc::new(store.clone()),
            Arc::new(InProcessSfu::new()),
            Arc::new(auth.clone()),
        )
        .await
        .unwrap();
        Fixture {
            store,
            auth,
            service,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Config::for_server(ServerId::from("cc-1"))).await
    }

    fn request(tab: &str) -> JoinRequest {
        JoinRequest::new(HuntId::from("h"), CallId::from("c"), TabId::from(tab))
    }

    #[tokio::test]
    async fn test_join_returns_call_snapshot() {
        let f = fixture().await;
        let sub = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();

        assert_eq!(sub.peer.initial_peer_state, PeerState::Active);
        assert!(sub.records.iter().any(|r| matches!(r, Record::Room(_))));
        assert!(sub
            .records
            .iter()
            .any(|r| matches!(r, Record::Peer(p) if p.meta.id == sub.peer.meta.id)));
    }

    #[tokio::test]
    async fn test_join_rejects_non_member_and_disabled() {
        let f = fixture().await;
        f.auth.revoke(&HuntId::from("h"), &UserId::from("carol"));
        let err = f
            .service
            .join(&UserId::from("carol"), request("t1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CallError::NotAMember(_)));

        let mut config = Config::for_server(ServerId::from("cc-2"));
        config.enabled = false;
        let disabled = fixture_with(config).await;
        let err = disabled
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CallError::FeatureDisabled));
    }

    #[tokio::test]
    async fn test_peer_commands_require_creator() {
        let f = fixture().await;
        let sub = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();

        let err = f
            .service
            .set_peer_state(
                &UserId::from("bob"),
                &sub.peer.peer_id(),
                DesiredPeerState::new(true, false),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_close_leaves_exactly_once() {
        let f = fixture().await;
        let sub = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();

        let outcome = sub.guard.close().await.unwrap();
        assert!(outcome.peer_removed);
        assert!(outcome.room_removed);
        assert!(repositories::all_rooms(&f.store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_leaves() {
        let f = fixture().await;
        let sub = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();
        drop(sub);

        for _ in 0..200 {
            if repositories::all_peers(&f.store).await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("peer not removed after drop");
    }

    #[tokio::test]
    async fn test_abandoned_close_still_leaves() {
        let f = fixture().await;
        let sub = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();

        // Another server holds the room lock, so the leave stalls there.
        let blocker = LockManager::new(
            Arc::new(f.store.clone()),
            &ServerId::from("cc-2"),
            LockConfig {
                preempt: Duration::from_secs(10),
                renew: Duration::from_millis(50),
            },
        );
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = tokio::spawn(async move {
            blocker
                .with_lock(&room_lock_name(&CallId::from("c")), || async move {
                    entered_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok::<_, CallError>(())
                })
                .await
        });
        entered_rx.await.unwrap();

        let close = sub.guard.close();
        assert!(tokio::time::timeout(Duration::from_millis(100), close)
            .await
            .is_err());
        assert_eq!(repositories::all_rooms(&f.store).await.unwrap().len(), 1);

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();

        for _ in 0..200 {
            if repositories::all_rooms(&f.store).await.unwrap().is_empty() {
                assert!(repositories::all_peers(&f.store).await.unwrap().is_empty());
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("room not removed after an abandoned close");
    }

    #[tokio::test]
    async fn test_remote_mute_flow() {
        let f = fixture().await;
        let alice = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();
        let _bob = f
            .service
            .join(&UserId::from("bob"), request("t2"))
            .await
            .unwrap();
        let alice_user = UserId::from("alice");
        let alice_peer = alice.peer.peer_id();

        let muted = f
            .service
            .remote_mute(&UserId::from("bob"), &alice_peer)
            .await
            .unwrap();
        assert!(muted.muted);
        assert_eq!(muted.remote_muted_by, Some(UserId::from("bob")));

        let err = f
            .service
            .remote_mute(&UserId::from("bob"), &alice_peer)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Conflict(_)));

        let err = f
            .service
            .set_peer_state(&alice_user, &alice_peer, DesiredPeerState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RemoteMuted(_)));

        let acked = f
            .service
            .ack_remote_mute(&alice_user, &alice_peer)
            .await
            .unwrap();
        assert!(acked.muted);
        assert!(acked.remote_muted_by.is_none());

        let unmuted = f
            .service
            .set_peer_state(&alice_user, &alice_peer, DesiredPeerState::default())
            .await
            .unwrap();
        assert!(!unmuted.muted);

        let audits = f
            .store
            .find_docs::<PeerRemoteMute>(Filter::default())
            .await
            .unwrap();
        assert_eq!(audits.len(), 1);
    }

    #[tokio::test]
    async fn test_negotiation_records_are_private() {
        let f = fixture().await;
        let mut alice = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();
        let bob = f
            .service
            .join(&UserId::from("bob"), request("t2"))
            .await
            .unwrap();

        f.service
            .request_transports(&UserId::from("bob"), &bob.peer.peer_id(), serde_json::json!({}))
            .await
            .unwrap();
        f.service
            .request_transports(
                &UserId::from("alice"),
                &alice.peer.peer_id(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        // Alice sees bob's Peer, then her own two Transports, never bob's.
        let mut own_transports = 0;
        while own_transports < 2 {
            let change = tokio::time::timeout(Duration::from_secs(2), alice.feed.recv())
                .await
                .unwrap()
                .unwrap();
            if let Record::Transport(t) = change.record() {
                assert_eq!(t.peer, alice.peer.peer_id());
                own_transports += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_transport_rejects_second_request() {
        let f = fixture().await;
        let mut alice = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();
        let user = UserId::from("alice");
        let peer = alice.peer.peer_id();
        f.service
            .request_transports(&user, &peer, serde_json::json!({}))
            .await
            .unwrap();

        let transport = loop {
            let change = tokio::time::timeout(Duration::from_secs(2), alice.feed.recv())
                .await
                .unwrap()
                .unwrap();
            if let Record::Transport(t) = change.into_record() {
                break t;
            }
        };

        f.service
            .connect_transport(&user, &peer, &transport.meta.id, serde_json::json!({"role": "client"}))
            .await
            .unwrap();
        let err = f
            .service
            .connect_transport(&user, &peer, &transport.meta.id, serde_json::json!({"role": "client"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_own_state() {
        let f = fixture().await;
        let _alice = f
            .service
            .join(&UserId::from("alice"), request("t1"))
            .await
            .unwrap();

        f.service.shutdown().await.unwrap();
        assert!(!f.service.health().is_ready());
        assert!(repositories::all_peers(&f.store).await.unwrap().is_empty());
        assert!(repositories::all_rooms(&f.store).await.unwrap().is_empty());
        assert!(repositories::all_servers(&f.store).await.unwrap().is_empty());
    }
}
