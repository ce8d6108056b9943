//! Scripted server for unit tests.
//!
//! Answers every command the way a routing server would, synchronously,
//! by pushing the resulting records onto the joined feed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::channel::{CallChannel, ChannelSubscription, SubscriptionGuard};
use crate::errors::ClientError;
use async_trait::async_trait;
use call_protocol::{
    Change, ChangeSender, ConnectAck, Consumer, DesiredPeerState, DocMeta, DtlsParameters,
    JoinRequest, MediaKind, Peer, PeerState, ProducerClient, ProducerServer, Record,
    RtpCapabilities, RtpParameters, Transport, TransportDirection, TransportRequest,
};
use common::types::{PeerId, ServerId, UserId};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct ScriptState {
    feed: Option<ChangeSender>,
    peer: Option<Peer>,
    request: Option<TransportRequest>,
    transports: HashMap<String, Transport>,
    fail_join: Option<ClientError>,
    fail_connect: bool,
    calls: Vec<String>,
    left: usize,
}

impl ScriptState {
    fn emit(&self, change: Change) {
        if let Some(feed) = &self.feed {
            let _ = feed.send(change);
        }
    }

    fn current(&self, direction: TransportDirection) -> Option<Transport> {
        self.transports
            .values()
            .find(|t| t.direction == direction)
            .cloned()
    }
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedChannel {
    state: Arc<Mutex<ScriptState>>,
}

fn server() -> ServerId {
    ServerId::from("cc-1")
}

fn server_user() -> UserId {
    UserId::from("cc-1")
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_join(&self, error: ClientError) {
        self.state.lock().unwrap().fail_join = Some(error);
    }

    pub(crate) fn fail_connect(&self) {
        self.state.lock().unwrap().fail_connect = true;
    }

    pub(crate) fn calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub(crate) fn left(&self) -> usize {
        self.state.lock().unwrap().left
    }

    pub(crate) fn peer(&self) -> Option<Peer> {
        self.state.lock().unwrap().peer.clone()
    }

    /// Another user remote-mutes our peer.
    pub(crate) fn remote_mute(&self, by: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(peer) = state.peer.as_mut() else {
            return;
        };
        peer.remote_muted_by = Some(UserId::from(by));
        peer.muted = true;
        let change = Change::Changed(Record::Peer(peer.clone()));
        state.emit(change);
    }

    /// A producer elsewhere in the call becomes a Consumer for us.
    pub(crate) fn add_consumer(&self, paused: bool) -> Consumer {
        let state = self.state.lock().unwrap();
        let peer = state.peer.clone().unwrap();
        let recv = state.current(TransportDirection::Recv).unwrap();
        let consumer = Consumer {
            meta: DocMeta::new(&server_user()),
            created_server: server(),
            hunt: peer.hunt.clone(),
            call: peer.call.clone(),
            peer: peer.peer_id(),
            transport_request: recv.transport_request.clone(),
            transport: recv.meta.id.clone(),
            producer_peer: PeerId::from("other-peer"),
            producer_server: "producer-server".to_string(),
            producer_id: "producer-other".to_string(),
            consumer_id: format!("consumer-{}", uuid::Uuid::new_v4().simple()),
            kind: MediaKind::Audio,
            rtp_parameters: json!({}),
            paused,
        };
        state.emit(Change::Added(Record::Consumer(consumer.clone())));
        consumer
    }

    pub(crate) fn update_consumer(&self, consumer: &Consumer) {
        let state = self.state.lock().unwrap();
        state.emit(Change::Changed(Record::Consumer(consumer.clone())));
    }

    pub(crate) fn remove_consumer(&self, consumer: &Consumer) {
        let state = self.state.lock().unwrap();
        state.emit(Change::Removed(Record::Consumer(consumer.clone())));
    }

    /// Discard and reissue both transports, as a restarted router does.
    pub(crate) fn replace_transports(&self) {
        let mut state = self.state.lock().unwrap();
        let old: Vec<Transport> = state.transports.drain().map(|(_, t)| t).collect();
        for transport in old {
            state.emit(Change::Removed(Record::Transport(transport)));
        }
        issue_transports(&mut state);
    }
}

fn issue_transports(state: &mut ScriptState) {
    let (Some(peer), Some(request)) = (state.peer.clone(), state.request.clone()) else {
        return;
    };
    for direction in TransportDirection::ALL {
        let transport = Transport {
            meta: DocMeta::new(&server_user()),
            created_server: server(),
            hunt: peer.hunt.clone(),
            call: peer.call.clone(),
            peer: peer.peer_id(),
            transport_request: request.meta.id.clone(),
            direction,
            transport_id: format!("sfu-transport-{}", uuid::Uuid::new_v4().simple()),
            ice_parameters: json!({"usernameFragment": "u"}),
            ice_candidates: json!([]),
            dtls_parameters: json!({"role": "auto"}),
        };
        state
            .transports
            .insert(transport.meta.id.clone(), transport.clone());
        state.emit(Change::Added(Record::Transport(transport)));
    }
}

struct ScriptedGuard {
    state: Arc<Mutex<ScriptState>>,
}

#[async_trait]
impl SubscriptionGuard for ScriptedGuard {
    async fn close(self: Box<Self>) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.left += 1;
        state.feed = None;
        Ok(())
    }
}

#[async_trait]
impl CallChannel for ScriptedChannel {
    async fn join(&self, request: JoinRequest) -> Result<ChannelSubscription, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("join".to_string());
        if let Some(error) = state.fail_join.clone() {
            return Err(error);
        }
        let (sender, feed) = mpsc::unbounded_channel();
        let desired = request.desired.unwrap_or_default();
        let peer = Peer {
            meta: DocMeta::new(&UserId::from("alice")),
            created_server: server(),
            hunt: request.hunt,
            call: request.call,
            tab: request.tab,
            initial_peer_state: PeerState::Active,
            remote_muted_by: None,
            muted: desired.muted,
            deafened: desired.deafened,
        };
        state.feed = Some(sender);
        state.peer = Some(peer.clone());
        Ok(ChannelSubscription {
            peer: peer.clone(),
            records: vec![Record::Peer(peer)],
            feed,
            guard: Box::new(ScriptedGuard {
                state: Arc::clone(&self.state),
            }),
        })
    }

    async fn request_transports(
        &self,
        peer: &PeerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<TransportRequest, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("request_transports".to_string());
        let own = state.peer.clone().unwrap();
        let request = TransportRequest {
            meta: DocMeta::new(own.user()),
            created_server: server(),
            hunt: own.hunt.clone(),
            call: own.call.clone(),
            peer: peer.clone(),
            rtp_capabilities,
        };
        state.request = Some(request.clone());
        issue_transports(&mut state);
        Ok(request)
    }

    async fn release_transports(&self, request: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("release_transports:{request}"));
        Ok(())
    }

    async fn connect_transport(
        &self,
        peer: &PeerId,
        transport: &str,
        _dtls_parameters: DtlsParameters,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("connect_transport:{transport}"));
        if state.fail_connect {
            return Err(ClientError::Negotiation("dtls rejected".to_string()));
        }
        let record = state
            .transports
            .get(transport)
            .cloned()
            .ok_or_else(|| ClientError::Rejected("no such transport".to_string()))?;
        let ack = ConnectAck {
            meta: DocMeta::new(&server_user()),
            created_server: server(),
            hunt: record.hunt.clone(),
            call: record.call.clone(),
            peer: peer.clone(),
            transport_request: record.transport_request.clone(),
            direction: record.direction,
            connect_request: uuid::Uuid::new_v4().simple().to_string(),
            transport: record.meta.id.clone(),
        };
        state.emit(Change::Added(Record::ConnectAck(ack)));
        Ok(())
    }

    async fn produce(
        &self,
        peer: &PeerId,
        transport: &str,
        track_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerClient, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("produce:{track_id}"));
        let record = state
            .transports
            .get(transport)
            .cloned()
            .ok_or_else(|| ClientError::Rejected("no such transport".to_string()))?;
        let own = state.peer.clone().unwrap();
        let producer = ProducerClient {
            meta: DocMeta::new(own.user()),
            created_server: server(),
            hunt: record.hunt.clone(),
            call: record.call.clone(),
            peer: peer.clone(),
            transport_request: record.transport_request.clone(),
            transport: record.meta.id.clone(),
            track_id: track_id.to_string(),
            kind,
            rtp_parameters,
        };
        let server_side = ProducerServer {
            meta: DocMeta::new(&server_user()),
            created_server: server(),
            hunt: record.hunt.clone(),
            call: record.call.clone(),
            peer: peer.clone(),
            transport_request: record.transport_request.clone(),
            producer_client: producer.meta.id.clone(),
            track_id: track_id.to_string(),
            producer_id: format!("producer-{}", uuid::Uuid::new_v4().simple()),
        };
        state.emit(Change::Added(Record::ProducerServer(server_side)));
        Ok(producer)
    }

    async fn stop_producing(&self, producer: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop_producing:{producer}"));
        Ok(())
    }

    async fn ack_consumer(&self, _peer: &PeerId, consumer: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("ack_consumer:{consumer}"));
        Ok(())
    }

    async fn set_peer_state(
        &self,
        _peer: &PeerId,
        desired: DesiredPeerState,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("set_peer_state".to_string());
        let Some(peer) = state.peer.as_mut() else {
            return Err(ClientError::Rejected("not joined".to_string()));
        };
        if peer.remote_muted_by.is_some() {
            return Err(ClientError::Rejected("remote mute outstanding".to_string()));
        }
        peer.muted = desired.muted;
        peer.deafened = desired.deafened;
        let change = Change::Changed(Record::Peer(peer.clone()));
        state.emit(change);
        Ok(())
    }

    async fn ack_remote_mute(&self, _peer: &PeerId) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("ack_remote_mute".to_string());
        let Some(peer) = state.peer.as_mut() else {
            return Err(ClientError::Rejected("not joined".to_string()));
        };
        peer.remote_muted_by = None;
        let change = Change::Changed(Record::Peer(peer.clone()));
        state.emit(change);
        Ok(())
    }
}
