//! Change feed entries and typed document access.

use crate::records::{DocMeta, Record};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Named collection in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Rooms,
    Peers,
    TransportRequests,
    Transports,
    ConnectRequests,
    ConnectAcks,
    ProducerClients,
    ProducerServers,
    Consumers,
    ConsumerAcks,
    PeerRemoteMutes,
    CallHistories,
    Locks,
    Servers,
}

impl Collection {
    /// Collections mirrored to a client subscribed to a call.
    pub const CLIENT_VISIBLE: [Collection; 7] = [
        Collection::Peers,
        Collection::Transports,
        Collection::ConnectAcks,
        Collection::ProducerServers,
        Collection::Consumers,
        Collection::Rooms,
        Collection::PeerRemoteMutes,
    ];

    /// Collection name for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Rooms => "rooms",
            Collection::Peers => "peers",
            Collection::TransportRequests => "transport_requests",
            Collection::Transports => "transports",
            Collection::ConnectRequests => "connect_requests",
            Collection::ConnectAcks => "connect_acks",
            Collection::ProducerClients => "producer_clients",
            Collection::ProducerServers => "producer_servers",
            Collection::Consumers => "consumers",
            Collection::ConsumerAcks => "consumer_acks",
            Collection::PeerRemoteMutes => "peer_remote_mutes",
            Collection::CallHistories => "call_histories",
            Collection::Locks => "locks",
            Collection::Servers => "servers",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed change to a live document.
///
/// `Removed` carries the last live value, so observers can still read the
/// fields that identified it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "camelCase")]
pub enum Change {
    Added(Record),
    Changed(Record),
    Removed(Record),
}

impl Change {
    /// The record this change concerns.
    #[must_use]
    pub fn record(&self) -> &Record {
        match self {
            Change::Added(r) | Change::Changed(r) | Change::Removed(r) => r,
        }
    }

    /// Consume the change, returning its record.
    #[must_use]
    pub fn into_record(self) -> Record {
        match self {
            Change::Added(r) | Change::Changed(r) | Change::Removed(r) => r,
        }
    }

    /// Whether this is a removal.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        matches!(self, Change::Removed(_))
    }

    /// Label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Added(_) => "added",
            Change::Changed(_) => "changed",
            Change::Removed(_) => "removed",
        }
    }
}

/// Receiving end of a change subscription.
pub type ChangeFeed = mpsc::UnboundedReceiver<Change>;

/// Sending end of a change subscription.
pub type ChangeSender = mpsc::UnboundedSender<Change>;

/// A record type that lives in exactly one collection.
pub trait Document: Clone + Send + Sync + Sized + 'static {
    /// The collection holding this document type.
    const COLLECTION: Collection;

    fn meta(&self) -> &DocMeta;

    fn meta_mut(&mut self) -> &mut DocMeta;

    /// Document id.
    fn id(&self) -> &str {
        &self.meta().id
    }

    fn into_record(self) -> Record;

    /// Downcast an owned record, returning `None` for other collections.
    fn from_record(record: Record) -> Option<Self>;

    /// Downcast a borrowed record, returning `None` for other collections.
    fn from_record_ref(record: &Record) -> Option<&Self>;
}
