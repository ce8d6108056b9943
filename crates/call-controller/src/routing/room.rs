//! `RoomRouter` - per-call actor that owns the call's SFU router.
//!
//! Runs only on the server named by the Room's `routed_server`. It watches
//! the call's negotiation records in store order and answers every request
//! record with the matching SFU object and ack record:
//!
//! | Observed              | Action                                          |
//! |-----------------------|-------------------------------------------------|
//! | TransportRequest +    | create send + recv transports, write Transports |
//! | TransportRequest -    | close its transports, remove derived records    |
//! | ConnectRequest +      | connect transport, write ConnectAck             |
//! | ProducerClient +      | produce, write ProducerServer and Consumers     |
//! | ProducerClient -      | close producer, remove ProducerServer/Consumers |
//! | ConsumerAck +         | resume consumer, clear `Consumer.paused`        |
//! | Consumer -            | close consumer                                  |
//!
//! SFU failures are logged and counted; the affected request stays
//! unacknowledged.

use crate::errors::CallError;
use crate::observability::metrics;
use crate::repositories::{self, system_user};
use crate::sfu::SfuClient;
use crate::store::{DocumentStore, DocumentStoreExt, Filter};
use call_protocol::{
    Change, Collection, ConnectAck, ConnectRequest, Consumer, ConsumerAck, DocMeta,
    ProducerClient, ProducerServer, Record, Room, Transport, TransportDirection, TransportRequest,
};
use common::types::{CallId, PeerId, ServerId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Collections a room router reacts to.
const WATCHED: [Collection; 7] = [
    Collection::TransportRequests,
    Collection::Transports,
    Collection::ConnectRequests,
    Collection::ProducerClients,
    Collection::ProducerServers,
    Collection::Consumers,
    Collection::ConsumerAcks,
];

/// Records tied to live SFU objects, discarded when the router (re)starts.
const DERIVED: [Collection; 7] = [
    Collection::Transports,
    Collection::ConnectRequests,
    Collection::ProducerClients,
    Collection::ConnectAcks,
    Collection::ProducerServers,
    Collection::Consumers,
    Collection::ConsumerAcks,
];

/// Handle to a running `RoomRouter`.
pub struct RoomRouterHandle {
    call: CallId,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl RoomRouterHandle {
    #[must_use]
    pub fn call(&self) -> &CallId {
        &self.call
    }

    /// Stop the router and wait for it to close its SFU objects.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            error!(target: "cc.routing.room", call = %self.call, error = %e, "Room router task failed");
        }
    }
}

struct TransportEntry {
    sfu_id: String,
    request: String,
    peer: PeerId,
    direction: TransportDirection,
}

struct ProducerEntry {
    producer_id: String,
    peer: PeerId,
    producer_server: String,
}

struct ConsumerEntry {
    consumer_id: String,
}

/// Per-call router actor.
pub struct RoomRouter {
    room: Room,
    server: ServerId,
    system: UserId,
    store: Arc<dyn DocumentStore>,
    sfu: Arc<dyn SfuClient>,
    router_id: Option<String>,
    requests: HashMap<String, TransportRequest>,
    /// Keyed by Transport document id.
    transports: HashMap<String, TransportEntry>,
    /// Keyed by ProducerClient document id.
    producers: HashMap<String, ProducerEntry>,
    /// Keyed by Consumer document id.
    consumers: HashMap<String, ConsumerEntry>,
}

impl RoomRouter {
    /// Spawn a router for `room`.
    #[must_use]
    pub fn spawn(
        room: Room,
        server: ServerId,
        store: Arc<dyn DocumentStore>,
        sfu: Arc<dyn SfuClient>,
        cancel_token: CancellationToken,
    ) -> RoomRouterHandle {
        let call = room.call.clone();
        let system = system_user(&server);
        let router = RoomRouter {
            room,
            server,
            system,
            store,
            sfu,
            router_id: None,
            requests: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        };
        let token = cancel_token.clone();
        let task = tokio::spawn(router.run(token));
        RoomRouterHandle {
            call,
            cancel_token,
            task,
        }
    }

    #[instrument(skip_all, name = "cc.routing.room", fields(call = %self.room.call, room = %self.room.meta.id))]
    async fn run(mut self, cancel_token: CancellationToken) {
        let (snapshot, mut feed) = match self.start().await {
            Ok(started) => started,
            Err(e) => {
                error!(target: "cc.routing.room", error = %e, "Room router failed to start");
                metrics::record_negotiation_step("router", "error");
                return;
            }
        };

        for record in snapshot {
            self.handle(Change::Added(record)).await;
        }

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                change = feed.recv() => {
                    match change {
                        Some(change) => self.handle(change).await,
                        None => {
                            warn!(target: "cc.routing.room", "Store feed closed");
                            break;
                        }
                    }
                }
            }
        }

        self.close().await;
    }

    /// Create the SFU router, discard records derived by a previous owner
    /// and subscribe to the call.
    async fn start(&mut self) -> Result<(Vec<Record>, call_protocol::ChangeFeed), CallError> {
        let router_id = self.sfu.create_router(&self.room.call).await?;
        info!(target: "cc.routing.room", router = %router_id, "SFU router created");
        self.router_id = Some(router_id);

        // SFU objects of a previous owner (or incarnation) are gone; clients
        // observe the transport replacement and renegotiate.
        let discarded = repositories::remove_matching(
            self.store.as_ref(),
            &Filter::collections(&DERIVED).in_call(&self.room.call),
        )
        .await?;
        if discarded > 0 {
            info!(target: "cc.routing.room", discarded, "Discarded records from a previous owner");
        }

        let (snapshot, feed) = self
            .store
            .watch(Filter::collections(&WATCHED).in_call(&self.room.call))
            .await?;
        Ok((snapshot, feed))
    }

    async fn close(&mut self) {
        if let Some(router_id) = self.router_id.take() {
            if let Err(e) = self.sfu.close_router(&router_id).await {
                warn!(target: "cc.routing.room", error = %e, "Failed to close SFU router");
            }
        }
        self.transports.clear();
        self.producers.clear();
        self.consumers.clear();
        info!(target: "cc.routing.room", "Room router stopped");
    }

    async fn handle(&mut self, change: Change) {
        let result = match change {
            Change::Added(Record::TransportRequest(r)) => self.on_transport_request(r).await,
            Change::Removed(Record::TransportRequest(r)) => {
                self.on_transport_request_removed(&r).await
            }
            Change::Removed(Record::Transport(t)) => {
                self.on_transport_removed(&t).await;
                Ok(())
            }
            Change::Added(Record::ConnectRequest(r)) => self.on_connect_request(r).await,
            Change::Added(Record::ProducerClient(p)) => self.on_producer_client(p).await,
            Change::Removed(Record::ProducerClient(p)) => self.on_producer_client_removed(&p).await,
            Change::Added(Record::ConsumerAck(a)) => self.on_consumer_ack(a).await,
            Change::Removed(Record::Consumer(c)) => {
                self.on_consumer_removed(&c).await;
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!(target: "cc.routing.room", error = %e, "Negotiation step failed");
        }
    }

    fn router_id(&self) -> Result<&str, CallError> {
        self.router_id
            .as_deref()
            .ok_or_else(|| CallError::Internal("SFU router not created".to_string()))
    }

    async fn on_transport_request(&mut self, request: TransportRequest) -> Result<(), CallError> {
        let request_id = request.meta.id.clone();
        debug!(target: "cc.routing.room", request = %request_id, peer = %request.peer, "Transport request");
        self.requests.insert(request_id.clone(), request.clone());

        let mut recv_transport = None;
        for direction in TransportDirection::ALL {
            let params = match self
                .sfu
                .create_transport(self.router_id()?, direction)
                .await
            {
                Ok(params) => params,
                Err(e) => {
                    metrics::record_negotiation_step("transport", "error");
                    return Err(e.into());
                }
            };
            let transport = Transport {
                meta: DocMeta::new(&self.system),
                created_server: self.server.clone(),
                hunt: request.hunt.clone(),
                call: request.call.clone(),
                peer: request.peer.clone(),
                transport_request: request_id.clone(),
                direction,
                transport_id: params.transport_id.clone(),
                ice_parameters: params.ice_parameters,
                ice_candidates: params.ice_candidates,
                dtls_parameters: params.dtls_parameters,
            };
            let transport = match self.store.insert_doc(transport).await {
                Ok(t) => t,
                Err(e) => {
                    // The request vanished or was answered already.
                    let _ = self.sfu.close_transport(&params.transport_id).await;
                    return Err(e.into());
                }
            };
            metrics::record_negotiation_step("transport", "ok");
            self.transports.insert(
                transport.meta.id.clone(),
                TransportEntry {
                    sfu_id: params.transport_id,
                    request: request_id.clone(),
                    peer: request.peer.clone(),
                    direction,
                },
            );
            if direction == TransportDirection::Recv {
                recv_transport = Some(transport.meta.id.clone());
            }
        }

        if let Some(recv) = recv_transport {
            let producers: Vec<(String, String, PeerId)> = self
                .producers
                .iter()
                .filter(|(_, p)| p.peer != request.peer)
                .map(|(pc, p)| (pc.clone(), p.producer_id.clone(), p.peer.clone()))
                .collect();
            for (producer_client, producer_id, producer_peer) in producers {
                if let Err(e) = self
                    .create_consumer(&recv, &producer_client, &producer_id, &producer_peer)
                    .await
                {
                    warn!(target: "cc.routing.room", error = %e, "Failed to consume existing producer");
                }
            }
        }
        Ok(())
    }

    async fn on_transport_request_removed(
        &mut self,
        request: &TransportRequest,
    ) -> Result<(), CallError> {
        self.requests.remove(&request.meta.id);
        let transports: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, t)| t.request == request.meta.id)
            .map(|(id, _)| id.clone())
            .collect();
        for doc_id in transports {
            if let Some(entry) = self.transports.remove(&doc_id) {
                self.forget_transport_objects(&doc_id, &entry).await;
            }
            self.store
                .remove(Collection::Transports, &doc_id)
                .await?;
        }
        // Acks and consumers keyed to this request.
        let derived = self
            .store
            .find(&Filter::collections(&DERIVED).in_call(&request.call).for_peer(&request.peer))
            .await?;
        for record in derived {
            if repositories::transport_request_of(&record) == Some(request.meta.id.as_str()) {
                self.store.remove(record.collection(), record.id()).await?;
            }
        }
        Ok(())
    }

    async fn on_transport_removed(&mut self, transport: &Transport) {
        if let Some(entry) = self.transports.remove(&transport.meta.id) {
            self.forget_transport_objects(&transport.meta.id, &entry)
                .await;
        }
    }

    /// Close an SFU transport and drop bookkeeping for objects on it.
    async fn forget_transport_objects(&mut self, doc_id: &str, entry: &TransportEntry) {
        if let Err(e) = self.sfu.close_transport(&entry.sfu_id).await {
            debug!(target: "cc.routing.room", error = %e, "Transport already closed");
        }
        if entry.direction == TransportDirection::Send {
            let dropped: Vec<String> = self
                .producers
                .iter()
                .filter(|(_, p)| p.peer == entry.peer)
                .map(|(id, _)| id.clone())
                .collect();
            for id in dropped {
                if let Some(producer) = self.producers.remove(&id) {
                    self.remove_consumers_of(&producer.producer_id).await;
                }
            }
        }
        debug!(target: "cc.routing.room", transport = %doc_id, "Transport closed");
    }

    async fn on_connect_request(&mut self, request: ConnectRequest) -> Result<(), CallError> {
        let Some(entry) = self.transports.get(&request.transport) else {
            warn!(target: "cc.routing.room", transport = %request.transport, "Connect request for unknown transport");
            metrics::record_negotiation_step("connect", "error");
            return Ok(());
        };
        if entry.direction != request.direction {
            metrics::record_negotiation_step("connect", "error");
            return Err(CallError::Conflict(
                "connect request direction does not match transport".to_string(),
            ));
        }

        if let Err(e) = self
            .sfu
            .connect_transport(&entry.sfu_id, &request.dtls_parameters)
            .await
        {
            metrics::record_negotiation_step("connect", "error");
            return Err(e.into());
        }

        self.store
            .insert_doc(ConnectAck {
                meta: DocMeta::new(&self.system),
                created_server: self.server.clone(),
                hunt: request.hunt.clone(),
                call: request.call.clone(),
                peer: request.peer.clone(),
                transport_request: request.transport_request.clone(),
                direction: request.direction,
                connect_request: request.meta.id.clone(),
                transport: request.transport.clone(),
            })
            .await?;
        metrics::record_negotiation_step("connect", "ok");
        Ok(())
    }

    async fn on_producer_client(&mut self, producer: ProducerClient) -> Result<(), CallError> {
        let Some(entry) = self.transports.get(&producer.transport) else {
            warn!(target: "cc.routing.room", transport = %producer.transport, "Produce on unknown transport");
            metrics::record_negotiation_step("produce", "error");
            return Ok(());
        };
        if entry.direction != TransportDirection::Send || entry.peer != producer.peer {
            metrics::record_negotiation_step("produce", "error");
            return Err(CallError::Conflict(
                "produce requires the peer's own send transport".to_string(),
            ));
        }

        let producer_id = match self
            .sfu
            .produce(&entry.sfu_id, producer.kind, &producer.rtp_parameters)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                metrics::record_negotiation_step("produce", "error");
                return Err(e.into());
            }
        };

        let server_record = match self
            .store
            .insert_doc(ProducerServer {
                meta: DocMeta::new(&self.system),
                created_server: self.server.clone(),
                hunt: producer.hunt.clone(),
                call: producer.call.clone(),
                peer: producer.peer.clone(),
                transport_request: producer.transport_request.clone(),
                producer_client: producer.meta.id.clone(),
                track_id: producer.track_id.clone(),
                producer_id: producer_id.clone(),
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                let _ = self.sfu.close_producer(&producer_id).await;
                return Err(e.into());
            }
        };
        metrics::record_negotiation_step("produce", "ok");

        self.producers.insert(
            producer.meta.id.clone(),
            ProducerEntry {
                producer_id: producer_id.clone(),
                peer: producer.peer.clone(),
                producer_server: server_record.meta.id,
            },
        );

        let receivers: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, t)| t.direction == TransportDirection::Recv && t.peer != producer.peer)
            .map(|(id, _)| id.clone())
            .collect();
        for recv in receivers {
            if let Err(e) = self
                .create_consumer(&recv, &producer.meta.id, &producer_id, &producer.peer)
                .await
            {
                warn!(target: "cc.routing.room", error = %e, "Failed to create consumer");
            }
        }
        Ok(())
    }

    async fn on_producer_client_removed(
        &mut self,
        producer: &ProducerClient,
    ) -> Result<(), CallError> {
        let Some(entry) = self.producers.remove(&producer.meta.id) else {
            return Ok(());
        };
        if let Err(e) = self.sfu.close_producer(&entry.producer_id).await {
            debug!(target: "cc.routing.room", error = %e, "Producer already closed");
        }
        self.store
            .remove(Collection::ProducerServers, &entry.producer_server)
            .await?;
        self.remove_consumers_of(&entry.producer_id).await;
        Ok(())
    }

    async fn remove_consumers_of(&mut self, producer_id: &str) {
        let consumers = match self
            .store
            .find_docs::<Consumer>(Filter::default().in_call(&self.room.call))
            .await
        {
            Ok(consumers) => consumers,
            Err(e) => {
                warn!(target: "cc.routing.room", error = %e, "Failed to list consumers");
                return;
            }
        };
        for consumer in consumers.into_iter().filter(|c| c.producer_id == producer_id) {
            if let Err(e) = self.store.remove_doc::<Consumer>(&consumer.meta.id).await {
                warn!(target: "cc.routing.room", error = %e, "Failed to remove consumer");
            }
        }
    }

    async fn create_consumer(
        &mut self,
        recv_transport: &str,
        producer_client: &str,
        producer_id: &str,
        producer_peer: &PeerId,
    ) -> Result<(), CallError> {
        let (sfu_transport, request_id, receiver) = match self.transports.get(recv_transport) {
            Some(t) => (t.sfu_id.clone(), t.request.clone(), t.peer.clone()),
            None => return Ok(()),
        };
        let Some(request) = self.requests.get(&request_id) else {
            return Ok(());
        };

        let params = match self
            .sfu
            .consume(&sfu_transport, producer_id, &request.rtp_capabilities)
            .await
        {
            Ok(params) => params,
            Err(e) => {
                metrics::record_negotiation_step("consume", "error");
                return Err(e.into());
            }
        };

        let consumer = Consumer {
            meta: DocMeta::new(&self.system),
            created_server: self.server.clone(),
            hunt: self.room.hunt.clone(),
            call: self.room.call.clone(),
            peer: receiver,
            transport_request: request_id,
            transport: recv_transport.to_string(),
            producer_peer: producer_peer.clone(),
            producer_server: producer_client.to_string(),
            producer_id: producer_id.to_string(),
            consumer_id: params.consumer_id.clone(),
            kind: params.kind,
            rtp_parameters: params.rtp_parameters,
            paused: true,
        };
        match self.store.insert_doc(consumer).await {
            Ok(consumer) => {
                metrics::record_negotiation_step("consume", "ok");
                self.consumers.insert(
                    consumer.meta.id,
                    ConsumerEntry {
                        consumer_id: params.consumer_id,
                    },
                );
                Ok(())
            }
            Err(e) => {
                let _ = self.sfu.close_consumer(&params.consumer_id).await;
                Err(e.into())
            }
        }
    }

    async fn on_consumer_ack(&mut self, ack: ConsumerAck) -> Result<(), CallError> {
        let Some(entry) = self.consumers.get(&ack.consumer) else {
            debug!(target: "cc.routing.room", consumer = %ack.consumer, "Ack for unknown consumer");
            return Ok(());
        };
        if let Err(e) = self.sfu.set_consumer_paused(&entry.consumer_id, false).await {
            metrics::record_negotiation_step("resume", "error");
            return Err(e.into());
        }
        let receiver = ack.peer.clone();
        let _: Consumer = repositories::update_doc(self.store.as_ref(), &ack.consumer, move |c: &mut Consumer| {
            if c.peer != receiver {
                return Err(CallError::PermissionDenied(
                    "consumer belongs to another peer".to_string(),
                ));
            }
            let changed = c.paused;
            c.paused = false;
            Ok(changed)
        })
        .await?;
        metrics::record_negotiation_step("resume", "ok");
        Ok(())
    }

    async fn on_consumer_removed(&mut self, consumer: &Consumer) {
        if let Some(entry) = self.consumers.remove(&consumer.meta.id) {
            if let Err(e) = self.sfu.close_consumer(&entry.consumer_id).await {
                debug!(target: "cc.routing.room", error = %e, "Consumer already closed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sfu::{InProcessSfu, SfuOperation};
    use crate::store::MemoryStore;
    use call_protocol::{MediaKind, Peer, PeerState};
    use common::types::{HuntId, TabId};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: MemoryStore,
        sfu: InProcessSfu,
        router: Option<RoomRouterHandle>,
    }

    async fn eventually<T, F, Fut>(mut check: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        for _ in 0..200 {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met");
    }

    async fn harness() -> Harness {
        let store = MemoryStore::new();
        let sfu = InProcessSfu::new();
        let room = store
            .insert_doc(Room {
                meta: DocMeta::new(&UserId::from("alice")),
                hunt: HuntId::from("h"),
                call: CallId::from("c"),
                routed_server: ServerId::from("cc-1"),
            })
            .await
            .unwrap();
        let router = RoomRouter::spawn(
            room,
            ServerId::from("cc-1"),
            Arc::new(store.clone()),
            Arc::new(sfu.clone()),
            CancellationToken::new(),
        );
        Harness {
            store,
            sfu,
            router: Some(router),
        }
    }

    async fn peer(store: &MemoryStore, tab: &str) -> Peer {
        store
            .insert_doc(Peer {
                meta: DocMeta::new(&UserId::from(tab)),
                created_server: ServerId::from("cc-1"),
                hunt: HuntId::from("h"),
                call: CallId::from("c"),
                tab: TabId::from(tab),
                initial_peer_state: PeerState::Active,
                remote_muted_by: None,
                muted: false,
                deafened: false,
            })
            .await
            .unwrap()
    }

    async fn request_transports(store: &MemoryStore, peer: &Peer) -> TransportRequest {
        store
            .insert_doc(TransportRequest {
                meta: DocMeta::new(peer.user()),
                created_server: ServerId::from("cc-2"),
                hunt: peer.hunt.clone(),
                call: peer.call.clone(),
                peer: peer.peer_id(),
                rtp_capabilities: json!({"codecs": []}),
            })
            .await
            .unwrap()
    }

    async fn transport(store: &MemoryStore, peer: &Peer, direction: TransportDirection) -> Transport {
        let peer_id = peer.peer_id();
        eventually(|| {
            let store = store.clone();
            let peer_id = peer_id.clone();
            async move {
                store
                    .find_docs::<Transport>(Filter::default().for_peer(&peer_id))
                    .await
                    .unwrap()
                    .into_iter()
                    .find(|t| t.direction == direction)
            }
        })
        .await
    }

    async fn connect(store: &MemoryStore, peer: &Peer, t: &Transport) {
        store
            .insert_doc(ConnectRequest {
                meta: DocMeta::new(peer.user()),
                created_server: ServerId::from("cc-2"),
                hunt: peer.hunt.clone(),
                call: peer.call.clone(),
                peer: peer.peer_id(),
                transport_request: t.transport_request.clone(),
                direction: t.direction,
                transport: t.meta.id.clone(),
                dtls_parameters: json!({"role": "client"}),
            })
            .await
            .unwrap();
        let connect_request_transport = t.meta.id.clone();
        eventually(|| {
            let store = store.clone();
            let transport = connect_request_transport.clone();
            async move {
                store
                    .find_docs::<ConnectAck>(Filter::default())
                    .await
                    .unwrap()
                    .into_iter()
                    .find(|a| a.transport == transport)
            }
        })
        .await;
    }

    async fn produce(store: &MemoryStore, peer: &Peer, send: &Transport) -> ProducerClient {
        store
            .insert_doc(ProducerClient {
                meta: DocMeta::new(peer.user()),
                created_server: ServerId::from("cc-2"),
                hunt: peer.hunt.clone(),
                call: peer.call.clone(),
                peer: peer.peer_id(),
                transport_request: send.transport_request.clone(),
                transport: send.meta.id.clone(),
                track_id: format!("track-{}", peer.tab),
                kind: MediaKind::Audio,
                rtp_parameters: json!({"codecs": [{"mimeType": "audio/opus"}]}),
            })
            .await
            .unwrap()
    }

    async fn connected_peer(store: &MemoryStore, tab: &str) -> (Peer, Transport, Transport) {
        let p = peer(store, tab).await;
        request_transports(store, &p).await;
        let send = transport(store, &p, TransportDirection::Send).await;
        let recv = transport(store, &p, TransportDirection::Recv).await;
        connect(store, &p, &send).await;
        connect(store, &p, &recv).await;
        (p, send, recv)
    }

    #[tokio::test]
    async fn test_transport_request_issues_both_directions() {
        let h = harness().await;
        let p = peer(&h.store, "t1").await;
        request_transports(&h.store, &p).await;

        let send = transport(&h.store, &p, TransportDirection::Send).await;
        let recv = transport(&h.store, &p, TransportDirection::Recv).await;
        assert_ne!(send.transport_id, recv.transport_id);
        assert!(send.ice_parameters.is_object());
        assert!(send.dtls_parameters.is_object());
        assert_eq!(h.sfu.stats().transports, 2);
    }

    #[tokio::test]
    async fn test_producer_fans_out_to_other_peers() {
        let h = harness().await;
        let (alice, alice_send, _) = connected_peer(&h.store, "alice").await;
        let (bob, _, _) = connected_peer(&h.store, "bob").await;

        let pc = produce(&h.store, &alice, &alice_send).await;
        let ps = eventually(|| {
            let store = h.store.clone();
            let pc_id = pc.meta.id.clone();
            async move {
                store
                    .find_docs::<ProducerServer>(Filter::default())
                    .await
                    .unwrap()
                    .into_iter()
                    .find(|p| p.producer_client == pc_id)
            }
        })
        .await;

        let consumer = eventually(|| {
            let store = h.store.clone();
            let bob_id = bob.peer_id();
            async move {
                store
                    .find_docs::<Consumer>(Filter::default().for_peer(&bob_id))
                    .await
                    .unwrap()
                    .into_iter()
                    .next()
            }
        })
        .await;
        assert_eq!(consumer.producer_id, ps.producer_id);
        assert_eq!(consumer.producer_peer, alice.peer_id());
        assert!(consumer.paused);

        // Nobody consumes their own track.
        let own = h
            .store
            .find_docs::<Consumer>(Filter::default().for_peer(&alice.peer_id()))
            .await
            .unwrap();
        assert!(own.is_empty());
    }

    #[tokio::test]
    async fn test_late_joiner_consumes_existing_producers_and_ack_resumes() {
        let h = harness().await;
        let (alice, alice_send, _) = connected_peer(&h.store, "alice").await;
        produce(&h.store, &alice, &alice_send).await;
        eventually(|| {
            let sfu = h.sfu.clone();
            async move { (sfu.stats().producers == 1).then_some(()) }
        })
        .await;

        let bob = peer(&h.store, "bob").await;
        request_transports(&h.store, &bob).await;
        let consumer = eventually(|| {
            let store = h.store.clone();
            let bob_id = bob.peer_id();
            async move {
                store
                    .find_docs::<Consumer>(Filter::default().for_peer(&bob_id))
                    .await
                    .unwrap()
                    .into_iter()
                    .next()
            }
        })
        .await;

        h.store
            .insert_doc(ConsumerAck {
                meta: DocMeta::new(bob.user()),
                hunt: bob.hunt.clone(),
                call: bob.call.clone(),
                peer: bob.peer_id(),
                consumer: consumer.meta.id.clone(),
            })
            .await
            .unwrap();
        eventually(|| {
            let store = h.store.clone();
            let id = consumer.meta.id.clone();
            async move {
                let c = store.get_doc::<Consumer>(&id).await.unwrap()?;
                (!c.paused).then_some(())
            }
        })
        .await;
        assert_eq!(h.sfu.stats().paused_consumers, 0);
    }

    #[tokio::test]
    async fn test_sfu_failure_leaves_request_unacknowledged() {
        let h = harness().await;
        h.sfu.fail(SfuOperation::CreateTransport);
        let p = peer(&h.store, "t1").await;
        request_transports(&h.store, &p).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let transports = h
            .store
            .find_docs::<Transport>(Filter::default())
            .await
            .unwrap();
        assert!(transports.is_empty());
    }

    #[tokio::test]
    async fn test_removing_producer_removes_consumers() {
        let h = harness().await;
        let (alice, alice_send, _) = connected_peer(&h.store, "alice").await;
        let (bob, _, _) = connected_peer(&h.store, "bob").await;
        let pc = produce(&h.store, &alice, &alice_send).await;
        eventually(|| {
            let store = h.store.clone();
            let bob_id = bob.peer_id();
            async move {
                let found = store
                    .find_docs::<Consumer>(Filter::default().for_peer(&bob_id))
                    .await
                    .unwrap();
                (!found.is_empty()).then_some(())
            }
        })
        .await;

        h.store
            .remove_doc::<ProducerClient>(&pc.meta.id)
            .await
            .unwrap();
        eventually(|| {
            let store = h.store.clone();
            async move {
                let consumers = store.find_docs::<Consumer>(Filter::default()).await.unwrap();
                let servers = store
                    .find_docs::<ProducerServer>(Filter::default())
                    .await
                    .unwrap();
                (consumers.is_empty() && servers.is_empty()).then_some(())
            }
        })
        .await;
        assert_eq!(h.sfu.stats().producers, 0);
    }

    #[tokio::test]
    async fn test_stop_closes_sfu_router() {
        let mut h = harness().await;
        connected_peer(&h.store, "alice").await;
        h.router.take().unwrap().stop().await;
        assert_eq!(h.sfu.stats().routers, 0);
        assert_eq!(h.sfu.stats().transports, 0);
    }

    #[tokio::test]
    async fn test_restart_reissues_transports() {
        let mut h = harness().await;
        let (alice, send, _) = connected_peer(&h.store, "alice").await;
        h.router.take().unwrap().stop().await;

        let room = repositories::find_room(&h.store, &CallId::from("c"))
            .await
            .unwrap()
            .unwrap();
        let _router = RoomRouter::spawn(
            room,
            ServerId::from("cc-1"),
            Arc::new(h.store.clone()),
            Arc::new(h.sfu.clone()),
            CancellationToken::new(),
        );

        let replaced = eventually(|| {
            let store = h.store.clone();
            let alice_id = alice.peer_id();
            let old = send.meta.id.clone();
            async move {
                store
                    .find_docs::<Transport>(Filter::default().for_peer(&alice_id))
                    .await
                    .unwrap()
                    .into_iter()
                    .find(|t| t.direction == TransportDirection::Send && t.meta.id != old)
            }
        })
        .await;
        assert_ne!(replaced.transport_id, send.transport_id);
        assert!(h
            .store
            .get_doc::<Transport>(&send.meta.id)
            .await
            .unwrap()
            .is_none());
    }
}
