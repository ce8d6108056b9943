//! Typed queries and mutations over the document store.

use crate::errors::CallError;
use crate::store::{DocumentStore, DocumentStoreExt, Filter, StoreError};
use call_protocol::{
    CallHistory, Collection, Consumer, DocMeta, Document, Peer, Record, Room, ServerRecord,
};
use chrono::Utc;
use common::types::{CallId, HuntId, PeerId, ServerId, TabId, UserId};
use tracing::debug;

/// Attempts for optimistic read-modify-write loops before giving up.
const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Negotiation collections removed together with their peer.
const PEER_OWNED: [Collection; 8] = [
    Collection::TransportRequests,
    Collection::Transports,
    Collection::ConnectRequests,
    Collection::ConnectAcks,
    Collection::ProducerClients,
    Collection::ProducerServers,
    Collection::Consumers,
    Collection::ConsumerAcks,
];

/// The live Room of a call.
///
/// # Errors
///
/// Propagates store errors.
pub async fn find_room(store: &dyn DocumentStore, call: &CallId) -> Result<Option<Room>, StoreError> {
    Ok(store
        .find_docs::<Room>(Filter::default().in_call(call))
        .await?
        .into_iter()
        .next())
}

/// All live Rooms.
///
/// # Errors
///
/// Propagates store errors.
pub async fn all_rooms(store: &dyn DocumentStore) -> Result<Vec<Room>, StoreError> {
    store.find_docs::<Room>(Filter::default()).await
}

/// Live Peers of a call.
///
/// # Errors
///
/// Propagates store errors.
pub async fn peers_in_call(store: &dyn DocumentStore, call: &CallId) -> Result<Vec<Peer>, StoreError> {
    store.find_docs::<Peer>(Filter::default().in_call(call)).await
}

/// All live Peers.
///
/// # Errors
///
/// Propagates store errors.
pub async fn all_peers(store: &dyn DocumentStore) -> Result<Vec<Peer>, StoreError> {
    store.find_docs::<Peer>(Filter::default()).await
}

/// The live Peer for one client session, if any.
///
/// # Errors
///
/// Propagates store errors.
pub async fn peer_for_tab(
    store: &dyn DocumentStore,
    hunt: &HuntId,
    call: &CallId,
    tab: &TabId,
) -> Result<Option<Peer>, StoreError> {
    Ok(peers_in_call(store, call)
        .await?
        .into_iter()
        .find(|p| &p.hunt == hunt && &p.tab == tab))
}

/// Fetch a live Peer by id.
///
/// # Errors
///
/// Returns `CallError::NotFound` if the peer does not exist.
pub async fn get_peer(store: &dyn DocumentStore, peer: &PeerId) -> Result<Peer, CallError> {
    store
        .get_doc::<Peer>(peer.as_str())
        .await?
        .ok_or_else(|| CallError::NotFound(format!("peer {peer}")))
}

/// Fetch a live document by id.
///
/// # Errors
///
/// Returns `CallError::NotFound` if it does not exist.
pub async fn get_required<D: Document>(store: &dyn DocumentStore, id: &str) -> Result<D, CallError> {
    store
        .get_doc::<D>(id)
        .await?
        .ok_or_else(|| CallError::NotFound(format!("{} {id}", D::COLLECTION)))
}

/// Read-modify-write a document with optimistic concurrency.
///
/// `mutate` returns `Ok(false)` when no write is needed. It may run more than
/// once if another writer wins the race.
///
/// # Errors
///
/// Returns `CallError::NotFound` if the document disappears, the error of
/// `mutate`, or `CallError::Internal` after repeated contention.
pub async fn update_doc<D, F>(store: &dyn DocumentStore, id: &str, mut mutate: F) -> Result<D, CallError>
where
    D: Document,
    F: FnMut(&mut D) -> Result<bool, CallError> + Send,
{
    for _ in 0..MAX_UPDATE_ATTEMPTS {
        let mut doc = get_required::<D>(store, id).await?;
        if !mutate(&mut doc)? {
            return Ok(doc);
        }
        match store.replace_doc(doc).await {
            Ok(updated) => return Ok(updated),
            Err(StoreError::Stale { .. }) => {
                debug!(target: "cc.registry", collection = %D::COLLECTION, id = %id, "Stale write, retrying");
            }
            Err(StoreError::NotFound { .. }) => {
                return Err(CallError::NotFound(format!("{} {id}", D::COLLECTION)));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(CallError::Internal(format!(
        "contention updating {} {id}",
        D::COLLECTION
    )))
}

/// Remove every live record matching `filter`. Returns how many were removed.
///
/// # Errors
///
/// Propagates store errors.
pub async fn remove_matching(store: &dyn DocumentStore, filter: &Filter) -> Result<usize, StoreError> {
    let mut removed = 0;
    for record in store.find(filter).await? {
        if store
            .remove(record.collection(), record.id())
            .await?
            .is_some()
        {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove a Peer with its negotiation records and every Consumer of its tracks.
///
/// Remote-mute audit records are kept.
///
/// # Errors
///
/// Propagates store errors.
pub async fn remove_peer_cascade(store: &dyn DocumentStore, peer: &Peer) -> Result<bool, StoreError> {
    let peer_id = peer.peer_id();

    remove_matching(
        store,
        &Filter::collections(&PEER_OWNED)
            .in_call(&peer.call)
            .for_peer(&peer_id),
    )
    .await?;

    let consuming: Vec<Consumer> = store
        .find_docs::<Consumer>(Filter::default().in_call(&peer.call))
        .await?
        .into_iter()
        .filter(|c| c.producer_peer == peer_id)
        .collect();
    for consumer in consuming {
        store.remove_doc::<Consumer>(&consumer.meta.id).await?;
    }

    Ok(store.remove_doc::<Peer>(&peer.meta.id).await?.is_some())
}

/// Record activity on a call.
///
/// # Errors
///
/// Propagates store errors other than lost races.
pub async fn touch_call_history(
    store: &dyn DocumentStore,
    hunt: &HuntId,
    call: &CallId,
    by: &UserId,
) -> Result<(), CallError> {
    for _ in 0..MAX_UPDATE_ATTEMPTS {
        let existing = store
            .find_docs::<CallHistory>(Filter::default().in_call(call))
            .await?
            .into_iter()
            .next();

        let result = match existing {
            Some(mut history) => {
                history.last_activity = Utc::now();
                store.replace_doc(history).await.map(|_| ())
            }
            None => store
                .insert_doc(CallHistory {
                    meta: DocMeta::new(by),
                    hunt: hunt.clone(),
                    call: call.clone(),
                    last_activity: Utc::now(),
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
    Err(CallError::Internal(format!("contention touching history of {call}")))
}

/// All live server heartbeat records.
///
/// # Errors
///
/// Propagates store errors.
pub async fn all_servers(store: &dyn DocumentStore) -> Result<Vec<ServerRecord>, StoreError> {
    store.find_docs::<ServerRecord>(Filter::default()).await
}

/// The heartbeat record of one server.
///
/// # Errors
///
/// Propagates store errors.
pub async fn server_record(
    store: &dyn DocumentStore,
    server: &ServerId,
) -> Result<Option<ServerRecord>, StoreError> {
    Ok(all_servers(store)
        .await?
        .into_iter()
        .find(|s| &s.server == server))
}

/// Attribution used for records written by a server on its own behalf.
#[must_use]
pub fn system_user(server: &ServerId) -> UserId {
    UserId::from(server.as_str())
}

/// The transport request a negotiation record hangs off.
#[must_use]
pub fn transport_request_of(record: &Record) -> Option<&str> {
    match record {
        Record::Transport(r) => Some(&r.transport_request),
        Record::ConnectRequest(r) => Some(&r.transport_request),
        Record::ConnectAck(r) => Some(&r.transport_request),
        Record::ProducerClient(r) => Some(&r.transport_request),
        Record::ProducerServer(r) => Some(&r.transport_request),
        Record::Consumer(r) => Some(&r.transport_request),
        _ => None,
    }
}

/// Whether a record is one of the negotiation records a peer owns.
#[must_use]
pub fn is_peer_owned(record: &Record) -> bool {
    PEER_OWNED.contains(&record.collection())
}
