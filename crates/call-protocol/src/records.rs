//! Document types stored in the shared store.
//!
//! Records are soft-deletable, timestamped and attributed. Their identity is
//! an opaque string id; cross-record references hold that id.

use crate::change::{Collection, Document};
use crate::media::{
    DtlsParameters, IceCandidates, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportDirection,
};
use crate::requests::DesiredPeerState;
use crate::state::PeerState;
use chrono::{DateTime, Utc};
use common::types::{new_document_id, CallId, HuntId, PeerId, ServerId, TabId, UserId};
use serde::{Deserialize, Serialize};

/// Metadata carried by every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocMeta {
    #[serde(rename = "_id")]
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: UserId,
}

impl DocMeta {
    /// Fresh metadata attributed to `created_by`.
    #[must_use]
    pub fn new(created_by: &UserId) -> Self {
        let now = Utc::now();
        Self {
            id: new_document_id(),
            created_at: now,
            updated_at: now,
            created_by: created_by.clone(),
        }
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// The call-level routing record. One live Room per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub hunt: HuntId,
    pub call: CallId,
    /// The only server allowed to talk to the SFU for this call.
    pub routed_server: ServerId,
}

/// One participant's presence in a call, scoped to one client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub created_server: ServerId,
    pub hunt: HuntId,
    pub call: CallId,
    pub tab: TabId,
    pub initial_peer_state: PeerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_muted_by: Option<UserId>,
    pub muted: bool,
    pub deafened: bool,
}

impl Peer {
    /// Typed id of this peer.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.meta.id.as_str())
    }

    /// The acting user who owns this peer.
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.meta.created_by
    }

    /// Effective mute/deafen state.
    #[must_use]
    pub fn effective_state(&self) -> PeerState {
        PeerState::effective(self.muted, self.deafened)
    }

    /// Both mute bits.
    #[must_use]
    pub fn bits(&self) -> DesiredPeerState {
        DesiredPeerState::new(self.muted, self.deafened)
    }
}

/// Declared intent to create a send/recv transport pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRequest {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub created_server: ServerId,
    pub hunt: HuntId,
    pub call: CallId,
    pub peer: PeerId,
    pub rtp_capabilities: RtpCapabilities,
}

/// SFU transport parameters issued by the routing server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transport {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub created_server: ServerId,
    pub hunt: HuntId,
    pub call: CallId,
    pub peer: PeerId,
    pub transport_request: String,
    pub direction: TransportDirection,
    /// SFU-issued transport id.
    pub transport_id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

/// Client DTLS parameters for a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub created_server: ServerId,
    pub hunt: HuntId,
    pub call: CallId,
    pub peer: PeerId,
    pub transport_request: String,
    pub direction: TransportDirection,
    /// Document id of the Transport being connected.
    pub transport: String,
    pub dtls_parameters: DtlsParameters,
}

/// Confirmation that a transport is connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAck {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub created_server: ServerId,
    pub hunt: HuntId,
    pub call: CallId,
    pub peer: PeerId,
    pub transport_request: String,
    pub direction: TransportDirection,
    pub connect_request: String,
    pub transport: String,
}

/// Intent to publish a locally captured track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClient {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub created_server: ServerId,
    pub hunt: HuntId,
    pub call: CallId,
    pub peer: PeerId,
    pub transport_request: String,
    /// Document id of the send Transport.
    pub transport: String,
    /// Client-generated track id.
    pub track_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Confirmation of a published track, carrying the SFU producer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerServer {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub created_server: ServerId,
    pub hunt: HuntId,
    pub call: CallId,
    pub peer: PeerId,
    pub transport_request: String,
    pub producer_client: String,
    pub track_id: String,
    /// SFU-issued producer id.
    pub producer_id: String,
}

/// Server-declared intent for one peer to receive another peer's track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumer {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub created_server: ServerId,
    pub hunt: HuntId,
    pub call: CallId,
    /// The receiving peer.
    pub peer: PeerId,
    pub transport_request: String,
    /// Document id of the receiving recv Transport.
    pub transport: String,
    pub producer_peer: PeerId,
    pub producer_server: String,
    pub producer_id: String,
    /// SFU-issued consumer id.
    pub consumer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Client confirmation that a consumer is set up locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerAck {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub hunt: HuntId,
    pub call: CallId,
    pub peer: PeerId,
    pub consumer: String,
}

/// Audit record of a forced mute. The live effect is carried on the Peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRemoteMute {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub hunt: HuntId,
    pub call: CallId,
    pub peer: PeerId,
    pub remote_muted_by: UserId,
}

/// Last activity per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistory {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub hunt: HuntId,
    pub call: CallId,
    pub last_activity: DateTime<Utc>,
}

/// Named, renewable mutual-exclusion lease. Unique on `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub name: String,
    pub renewed_at: DateTime<Utc>,
}

/// Liveness heartbeat of one application server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    #[serde(flatten)]
    pub meta: DocMeta,
    pub server: ServerId,
    pub hostname: String,
    pub pid: u32,
}

/// Any stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "doc", rename_all = "camelCase")]
pub enum Record {
    Room(Room),
    Peer(Peer),
    TransportRequest(TransportRequest),
    Transport(Transport),
    ConnectRequest(ConnectRequest),
    ConnectAck(ConnectAck),
    ProducerClient(ProducerClient),
    ProducerServer(ProducerServer),
    Consumer(Consumer),
    ConsumerAck(ConsumerAck),
    PeerRemoteMute(PeerRemoteMute),
    CallHistory(CallHistory),
    Lock(LockRecord),
    Server(ServerRecord),
}

macro_rules! dispatch {
    ($record:expr, $doc:ident => $body:expr) => {
        match $record {
            Record::Room($doc) => $body,
            Record::Peer($doc) => $body,
            Record::TransportRequest($doc) => $body,
            Record::Transport($doc) => $body,
            Record::ConnectRequest($doc) => $body,
            Record::ConnectAck($doc) => $body,
            Record::ProducerClient($doc) => $body,
            Record::ProducerServer($doc) => $body,
            Record::Consumer($doc) => $body,
            Record::ConsumerAck($doc) => $body,
            Record::PeerRemoteMute($doc) => $body,
            Record::CallHistory($doc) => $body,
            Record::Lock($doc) => $body,
            Record::Server($doc) => $body,
        }
    };
}

impl Record {
    /// The collection this record lives in.
    #[must_use]
    pub fn collection(&self) -> Collection {
        match self {
            Record::Room(_) => Collection::Rooms,
            Record::Peer(_) => Collection::Peers,
            Record::TransportRequest(_) => Collection::TransportRequests,
            Record::Transport(_) => Collection::Transports,
            Record::ConnectRequest(_) => Collection::ConnectRequests,
            Record::ConnectAck(_) => Collection::ConnectAcks,
            Record::ProducerClient(_) => Collection::ProducerClients,
            Record::ProducerServer(_) => Collection::ProducerServers,
            Record::Consumer(_) => Collection::Consumers,
            Record::ConsumerAck(_) => Collection::ConsumerAcks,
            Record::PeerRemoteMute(_) => Collection::PeerRemoteMutes,
            Record::CallHistory(_) => Collection::CallHistories,
            Record::Lock(_) => Collection::Locks,
            Record::Server(_) => Collection::Servers,
        }
    }

    /// Document metadata.
    #[must_use]
    pub fn meta(&self) -> &DocMeta {
        dispatch!(self, doc => &doc.meta)
    }

    /// Mutable document metadata.
    pub fn meta_mut(&mut self) -> &mut DocMeta {
        dispatch!(self, doc => &mut doc.meta)
    }

    /// Document id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.meta().id
    }

    /// The call this record belongs to, if any.
    #[must_use]
    pub fn call(&self) -> Option<&CallId> {
        match self {
            Record::Room(r) => Some(&r.call),
            Record::Peer(r) => Some(&r.call),
            Record::TransportRequest(r) => Some(&r.call),
            Record::Transport(r) => Some(&r.call),
            Record::ConnectRequest(r) => Some(&r.call),
            Record::ConnectAck(r) => Some(&r.call),
            Record::ProducerClient(r) => Some(&r.call),
            Record::ProducerServer(r) => Some(&r.call),
            Record::Consumer(r) => Some(&r.call),
            Record::ConsumerAck(r) => Some(&r.call),
            Record::PeerRemoteMute(r) => Some(&r.call),
            Record::CallHistory(r) => Some(&r.call),
            Record::Lock(_) | Record::Server(_) => None,
        }
    }

    /// The peer a negotiation record belongs to, if any.
    ///
    /// For a Consumer this is the receiving peer.
    #[must_use]
    pub fn owning_peer(&self) -> Option<&PeerId> {
        match self {
            Record::TransportRequest(r) => Some(&r.peer),
            Record::Transport(r) => Some(&r.peer),
            Record::ConnectRequest(r) => Some(&r.peer),
            Record::ConnectAck(r) => Some(&r.peer),
            Record::ProducerClient(r) => Some(&r.peer),
            Record::ProducerServer(r) => Some(&r.peer),
            Record::Consumer(r) => Some(&r.peer),
            Record::ConsumerAck(r) => Some(&r.peer),
            Record::PeerRemoteMute(r) => Some(&r.peer),
            Record::Room(_)
            | Record::Peer(_)
            | Record::CallHistory(_)
            | Record::Lock(_)
            | Record::Server(_) => None,
        }
    }

    /// Key that must be unique among live records of the same collection.
    #[must_use]
    pub fn unique_key(&self) -> Option<String> {
        match self {
            Record::Room(r) => Some(r.call.to_string()),
            Record::Peer(r) => Some(format!("{}/{}/{}", r.hunt, r.call, r.tab)),
            Record::Transport(r) => Some(format!("{}/{}", r.transport_request, r.direction)),
            Record::ConnectRequest(r) => Some(r.transport.clone()),
            Record::ConnectAck(r) => Some(r.connect_request.clone()),
            Record::ProducerClient(r) => Some(format!("{}/{}", r.transport, r.track_id)),
            Record::ProducerServer(r) => Some(r.producer_client.clone()),
            Record::ConsumerAck(r) => Some(r.consumer.clone()),
            Record::CallHistory(r) => Some(r.call.to_string()),
            Record::Lock(r) => Some(r.name.clone()),
            Record::Server(r) => Some(r.server.to_string()),
            Record::TransportRequest(_) | Record::Consumer(_) | Record::PeerRemoteMute(_) => None,
        }
    }
}

macro_rules! impl_document {
    ($ty:ident, $variant:ident, $collection:ident) => {
        impl Document for $ty {
            const COLLECTION: Collection = Collection::$collection;

            fn meta(&self) -> &DocMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut DocMeta {
                &mut self.meta
            }

            fn into_record(self) -> Record {
                Record::$variant(self)
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$variant(doc) => Some(doc),
                    _ => None,
                }
            }

            fn from_record_ref(record: &Record) -> Option<&Self> {
                match record {
                    Record::$variant(doc) => Some(doc),
                    _ => None,
                }
            }
        }
    };
}

impl_document!(Room, Room, Rooms);
impl_document!(Peer, Peer, Peers);
impl_document!(TransportRequest, TransportRequest, TransportRequests);
impl_document!(Transport, Transport, Transports);
impl_document!(ConnectRequest, ConnectRequest, ConnectRequests);
impl_document!(ConnectAck, ConnectAck, ConnectAcks);
impl_document!(ProducerClient, ProducerClient, ProducerClients);
impl_document!(ProducerServer, ProducerServer, ProducerServers);
impl_document!(Consumer, Consumer, Consumers);
impl_document!(ConsumerAck, ConsumerAck, ConsumerAcks);
impl_document!(PeerRemoteMute, PeerRemoteMute, PeerRemoteMutes);
impl_document!(CallHistory, CallHistory, CallHistories);
impl_document!(LockRecord, Lock, Locks);
impl_document!(ServerRecord, Server, Servers);
