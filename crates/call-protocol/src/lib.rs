//! Wire shapes for the call subsystem.
//!
//! Every record here is a document in the shared store and is mirrored to
//! interested clients through the reactive channel. Request/ack pairs exist
//! because the requester and the authority may be different processes: the
//! ack record is the only observable outcome of a request.
//!
//! # Modules
//!
//! - [`records`] - Document types (Room, Peer, negotiation records, Lock, Server)
//! - [`change`] - Change feed entries and the `Document` trait for typed access
//! - [`state`] - Mute/deafen bits and the effective-state rule
//! - [`requests`] - Join and command payloads
//! - [`media`] - Opaque SFU parameter blobs

#![warn(clippy::pedantic)]

pub mod change;
pub mod media;
pub mod records;
pub mod requests;
pub mod state;

pub use change::{Change, ChangeFeed, ChangeSender, Collection, Document};
pub use media::{
    DtlsParameters, IceCandidates, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportDirection,
};
pub use records::{
    CallHistory, ConnectAck, ConnectRequest, Consumer, ConsumerAck, DocMeta, LockRecord, Peer,
    PeerRemoteMute, ProducerClient, ProducerServer, Record, Room, ServerRecord, Transport,
    TransportRequest,
};
pub use requests::{DesiredPeerState, JoinRequest};
pub use state::PeerState;
