//! `CallConnection` - per-call negotiation actor.
//!
//! Joins the call, asks for a send and a recv transport, and mirrors the
//! call's records into local media objects:
//!
//! - Per direction: the transport is built when its Transport record
//!   appears. The media layer's connect callback is parked in a single slot
//!   per direction and resolved by the ConnectAck for that direction and
//!   transport, exactly once.
//! - Per local track: produced on the send transport. The produce callback
//!   is parked per track and resolved with the id from the matching
//!   ProducerServer.
//! - Per Consumer record (keyed by document id): consumed, acknowledged,
//!   paused or resumed to follow the record, closed when it disappears.
//!
//! A removed Transport means the routing server replaced it; everything
//! built on it is closed and rebuilt on the replacement.
//!
//! Any negotiation failure ends the connection in `Failed`. Nothing is
//! retried.

use crate::channel::{CallChannel, SubscriptionGuard};
use crate::errors::ClientError;
use crate::media::{
    LocalTrack, MediaConsumer, MediaDevice, MediaProducer, MediaTransport, TransportEvent,
    TransportEvents,
};
use crate::mute::{MuteAction, MuteReconciler};
use call_protocol::{
    Change, ConnectAck, Consumer, DesiredPeerState, JoinRequest, Peer, PeerState, ProducerServer,
    Record, Transport, TransportDirection,
};
use common::types::{PeerId, UserId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Negotiation phase of one transport direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPhase {
    #[default]
    Idle,
    Requested,
    ParametersIssued,
    ConnectRequested,
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Joining,
    Connected,
    Failed(String),
    Closed,
}

/// Observable state of a connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub peer: Option<Peer>,
    /// Other peers in the call, ordered by document id.
    pub others: Vec<Peer>,
    pub desired: DesiredPeerState,
    pub effective: Option<PeerState>,
    pub remote_mute_notice: Option<UserId>,
    pub send: TransportPhase,
    pub recv: TransportPhase,
    /// Local producers with a server-issued id.
    pub producers: usize,
    pub paused_producers: usize,
    pub consumers: usize,
    pub paused_consumers: usize,
    pub last_error: Option<String>,
}

enum ConnectionCommand {
    SetMuted {
        muted: bool,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    SetDeafened {
        deafened: bool,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    DismissRemoteMute {
        respond_to: oneshot::Sender<()>,
    },
    Leave {
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// Results of work the actor spawned, tagged with the Transport document
/// they were started on so late results for a replaced transport are dropped.
enum Internal {
    Event {
        direction: TransportDirection,
        transport: String,
        event: TransportEvent,
    },
    Produced {
        track_id: String,
        transport: String,
        result: Result<Arc<dyn MediaProducer>, ClientError>,
    },
    Consumed {
        consumer: String,
        transport: String,
        result: Result<Arc<dyn MediaConsumer>, ClientError>,
    },
}

/// Handle to a `CallConnection` actor.
pub struct CallConnection {
    sender: mpsc::Sender<ConnectionCommand>,
    cancel_token: CancellationToken,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl CallConnection {
    /// Spawn a connection that joins with `request` and publishes `tracks`.
    #[must_use]
    pub fn spawn(
        channel: Arc<dyn CallChannel>,
        device: Arc<dyn MediaDevice>,
        request: JoinRequest,
        tracks: watch::Receiver<Vec<LocalTrack>>,
    ) -> Self {
        let (sender, commands) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let mute = MuteReconciler::new(request.desired);
        let (snapshot_tx, snapshot) = watch::channel(ConnectionSnapshot {
            desired: mute.desired(),
            ..ConnectionSnapshot::default()
        });
        let cancel_token = CancellationToken::new();

        let actor = ConnectionActor {
            channel,
            device,
            request,
            tracks,
            commands,
            internal_tx,
            internal_rx,
            cancel_token: cancel_token.clone(),
            snapshot: snapshot_tx,
            mute,
            peer: None,
            others: BTreeMap::new(),
            transport_request: None,
            send: DirectionState::default(),
            recv: DirectionState::default(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            guard: None,
            status: ConnectionStatus::Joining,
            last_error: None,
        };
        let task = tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            snapshot,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.snapshot.borrow().status.clone()
    }

    /// # Errors
    ///
    /// `RemoteMuteNotDismissed` when unmuting before dismissing the notice.
    pub async fn set_muted(&self, muted: bool) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionCommand::SetMuted {
            muted,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| closed())?
    }

    /// # Errors
    ///
    /// Fails when the connection has ended.
    pub async fn set_deafened(&self, deafened: bool) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionCommand::SetDeafened {
            deafened,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| closed())?
    }

    /// # Errors
    ///
    /// Fails when the connection has ended.
    pub async fn dismiss_remote_mute(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionCommand::DismissRemoteMute { respond_to: tx })
            .await?;
        rx.await.map_err(|_| closed())
    }

    /// Close all media and leave the call. A connection that already ended
    /// (failed) has left already.
    ///
    /// # Errors
    ///
    /// Returns the server's error from leaving.
    pub async fn leave(mut self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        let result = if self
            .sender
            .send(ConnectionCommand::Leave { respond_to: tx })
            .await
            .is_ok()
        {
            rx.await.unwrap_or(Ok(()))
        } else {
            Ok(())
        };
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(target: "client.connection", error = %e, "Connection task failed");
            }
        }
        result
    }

    async fn send(&self, command: ConnectionCommand) -> Result<(), ClientError> {
        self.sender.send(command).await.map_err(|_| closed())
    }
}

impl Drop for CallConnection {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel_token.cancel();
        }
    }
}

fn closed() -> ClientError {
    ClientError::InvalidState("connection closed".to_string())
}

#[derive(Default)]
struct DirectionState {
    phase: TransportPhase,
    /// Transport document id the media transport was built from.
    record: Option<String>,
    media: Option<Arc<dyn MediaTransport>>,
    pending_connect: Option<oneshot::Sender<Result<(), ClientError>>>,
    events: Option<CancellationToken>,
}

impl DirectionState {
    fn is_current(&self, transport: &str) -> bool {
        self.record.as_deref() == Some(transport)
    }

    fn close(&mut self) {
        if let Some(events) = self.events.take() {
            events.cancel();
        }
        if let Some(media) = self.media.take() {
            media.close();
        }
        if let Some(pending) = self.pending_connect.take() {
            let _ = pending.send(Err(ClientError::Negotiation(
                "transport replaced".to_string(),
            )));
        }
        self.record = None;
    }
}

struct ProducerEntry {
    track: LocalTrack,
    /// Send transport the produce was started on.
    transport: Option<String>,
    task: Option<JoinHandle<()>>,
    producer_client: Option<String>,
    pending: Option<oneshot::Sender<Result<String, ClientError>>>,
    media: Option<Arc<dyn MediaProducer>>,
}

impl ProducerEntry {
    fn new(track: LocalTrack) -> Self {
        Self {
            track,
            transport: None,
            task: None,
            producer_client: None,
            pending: None,
            media: None,
        }
    }

    /// Drop everything negotiated; the track itself stays wanted.
    fn reset(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(media) = self.media.take() {
            media.close();
        }
        self.pending = None;
        self.producer_client = None;
        self.transport = None;
    }
}

struct ConsumerEntry {
    record: Consumer,
    task: Option<JoinHandle<()>>,
    media: Option<Arc<dyn MediaConsumer>>,
}

impl ConsumerEntry {
    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(media) = self.media.take() {
            media.close();
        }
    }
}

struct ConnectionActor {
    channel: Arc<dyn CallChannel>,
    device: Arc<dyn MediaDevice>,
    request: JoinRequest,
    tracks: watch::Receiver<Vec<LocalTrack>>,
    commands: mpsc::Receiver<ConnectionCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    cancel_token: CancellationToken,
    snapshot: watch::Sender<ConnectionSnapshot>,
    mute: MuteReconciler,
    peer: Option<Peer>,
    others: BTreeMap<String, Peer>,
    transport_request: Option<String>,
    send: DirectionState,
    recv: DirectionState,
    /// Keyed by local track id.
    producers: HashMap<String, ProducerEntry>,
    /// Keyed by Consumer document id.
    consumers: HashMap<String, ConsumerEntry>,
    guard: Option<Box<dyn SubscriptionGuard>>,
    status: ConnectionStatus,
    last_error: Option<String>,
}

impl ConnectionActor {
    #[instrument(skip_all, name = "client.connection", fields(call = %self.request.call, tab = %self.request.tab))]
    async fn run(mut self) {
        let mut feed = match self.start().await {
            Ok(feed) => feed,
            Err(e) => {
                self.fail(&e).await;
                return;
            }
        };

        let mut tracks_open = true;
        let outcome: Result<bool, ClientError> = loop {
            let step = tokio::select! {
                () = self.cancel_token.cancelled() => Ok(false),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => Ok(false),
                },
                change = feed.recv() => match change {
                    Some(change) => self.on_change(change).await.map(|()| true),
                    None => Err(ClientError::Channel("call subscription closed".to_string())),
                },
                Some(internal) = self.internal_rx.recv() => {
                    self.on_internal(internal).await.map(|()| true)
                }
                changed = self.tracks.changed(), if tracks_open => {
                    if changed.is_err() {
                        tracks_open = false;
                        Ok(true)
                    } else {
                        self.on_tracks_changed().map(|()| true)
                    }
                }
            };
            match step {
                Ok(true) => self.publish(),
                Ok(false) => break Ok(false),
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(_) => {
                let result = self.teardown().await;
                self.status = ConnectionStatus::Closed;
                if let Err(e) = result {
                    self.last_error = Some(e.to_string());
                }
                self.publish();
                info!(target: "client.connection", "Connection closed");
            }
            Err(e) => self.fail(&e).await,
        }
    }

    async fn start(&mut self) -> Result<call_protocol::ChangeFeed, ClientError> {
        let subscription = self.channel.join(self.request.clone()).await?;
        self.guard = Some(subscription.guard);
        let own = subscription.peer;
        info!(target: "client.connection", peer = %own.meta.id, "Joined call");
        self.on_peer(own).await?;
        for record in subscription.records {
            self.on_upsert(record).await?;
        }

        let peer = self.peer_id()?;
        let request = self
            .channel
            .request_transports(&peer, self.device.rtp_capabilities())
            .await?;
        self.transport_request = Some(request.meta.id);
        self.send.phase = TransportPhase::Requested;
        self.recv.phase = TransportPhase::Requested;
        self.status = ConnectionStatus::Connected;
        self.on_tracks_changed()?;
        self.publish();
        Ok(subscription.feed)
    }

    fn peer_id(&self) -> Result<PeerId, ClientError> {
        self.peer
            .as_ref()
            .map(Peer::peer_id)
            .ok_or_else(|| ClientError::InvalidState("not joined".to_string()))
    }

    fn is_own(&self, peer: &PeerId) -> bool {
        self.peer
            .as_ref()
            .is_some_and(|p| p.meta.id == peer.as_str())
    }

    /// Returns `Ok(false)` when the actor should stop.
    async fn on_command(&mut self, command: ConnectionCommand) -> Result<bool, ClientError> {
        match command {
            ConnectionCommand::SetMuted { muted, respond_to } => {
                match self.mute.set_muted(muted) {
                    Ok(actions) => {
                        self.run_mute_actions(actions).await;
                        self.apply_local_pause();
                        let _ = respond_to.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                }
                Ok(true)
            }
            ConnectionCommand::SetDeafened {
                deafened,
                respond_to,
            } => {
                let actions = self.mute.set_deafened(deafened);
                self.run_mute_actions(actions).await;
                self.apply_local_pause();
                let _ = respond_to.send(Ok(()));
                Ok(true)
            }
            ConnectionCommand::DismissRemoteMute { respond_to } => {
                self.mute.dismiss_notice();
                let _ = respond_to.send(());
                Ok(true)
            }
            ConnectionCommand::Leave { respond_to } => {
                let result = self.teardown().await;
                self.status = ConnectionStatus::Closed;
                self.publish();
                let _ = respond_to.send(result);
                Ok(false)
            }
        }
    }

    async fn on_change(&mut self, change: Change) -> Result<(), ClientError> {
        match change {
            Change::Added(record) | Change::Changed(record) => self.on_upsert(record).await,
            Change::Removed(record) => self.on_removed(record).await,
        }
    }

    async fn on_upsert(&mut self, record: Record) -> Result<(), ClientError> {
        match record {
            Record::Peer(peer) => self.on_peer(peer).await,
            Record::Transport(transport) => self.on_transport(transport).await,
            Record::ConnectAck(ack) => {
                self.on_connect_ack(&ack);
                Ok(())
            }
            Record::ProducerServer(producer) => {
                self.on_producer_server(&producer);
                Ok(())
            }
            Record::Consumer(consumer) => {
                self.on_consumer(consumer);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_removed(&mut self, record: Record) -> Result<(), ClientError> {
        match record {
            Record::Peer(peer) => {
                if self.peer.as_ref().is_some_and(|p| p.meta.id == peer.meta.id) {
                    return Err(ClientError::Channel(
                        "removed from the call by the server".to_string(),
                    ));
                }
                self.others.remove(&peer.meta.id);
            }
            Record::Transport(transport) => {
                let state = self.direction_mut(transport.direction);
                if state.is_current(&transport.meta.id) {
                    debug!(target: "client.connection", direction = transport.direction.as_str(), "Transport replaced by server");
                    state.close();
                    state.phase = TransportPhase::Requested;
                    self.on_transport_lost(transport.direction);
                }
            }
            Record::Consumer(consumer) => {
                if let Some(mut entry) = self.consumers.remove(&consumer.meta.id) {
                    entry.close();
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_peer(&mut self, peer: Peer) -> Result<(), ClientError> {
        let own = match &self.peer {
            Some(own) => own.meta.id == peer.meta.id,
            None => true,
        };
        if !own {
            self.others.insert(peer.meta.id.clone(), peer);
            return Ok(());
        }
        let actions = self.mute.observe(&peer);
        self.peer = Some(peer);
        self.run_mute_actions(actions).await;
        self.apply_local_pause();
        Ok(())
    }

    async fn run_mute_actions(&mut self, actions: Vec<MuteAction>) {
        let Ok(peer) = self.peer_id() else {
            return;
        };
        for action in actions {
            let result = match action {
                MuteAction::AckRemoteMute => self.channel.ack_remote_mute(&peer).await,
                MuteAction::Push(desired) => {
                    let result = self.channel.set_peer_state(&peer, desired).await;
                    if result.is_err() {
                        self.mute.push_failed();
                    }
                    result
                }
            };
            if let Err(e) = result {
                warn!(target: "client.connection", error = %e, "Mute update failed");
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn direction_mut(&mut self, direction: TransportDirection) -> &mut DirectionState {
        match direction {
            TransportDirection::Send => &mut self.send,
            TransportDirection::Recv => &mut self.recv,
        }
    }

    fn direction(&self, direction: TransportDirection) -> &DirectionState {
        match direction {
            TransportDirection::Send => &self.send,
            TransportDirection::Recv => &self.recv,
        }
    }

    async fn on_transport(&mut self, transport: Transport) -> Result<(), ClientError> {
        if !self.is_own(&transport.peer)
            || self.transport_request.as_deref() != Some(transport.transport_request.as_str())
        {
            return Ok(());
        }
        let direction = transport.direction;
        if self.direction(direction).is_current(&transport.meta.id) {
            return Ok(());
        }
        if self.direction(direction).record.is_some() {
            self.direction_mut(direction).close();
            self.on_transport_lost(direction);
        }

        let (media, events) = self.device.create_transport(direction, &transport).await?;
        let token = self.cancel_token.child_token();
        self.spawn_event_forwarder(direction, transport.meta.id.clone(), events, token.clone());

        let state = self.direction_mut(direction);
        state.record = Some(transport.meta.id.clone());
        state.media = Some(media);
        state.events = Some(token);
        state.phase = TransportPhase::ParametersIssued;
        debug!(target: "client.connection", direction = direction.as_str(), transport = %transport.meta.id, "Transport parameters issued");

        match direction {
            TransportDirection::Send => {
                let tracks: Vec<String> = self.producers.keys().cloned().collect();
                for track in tracks {
                    self.start_produce(&track);
                }
            }
            TransportDirection::Recv => {
                let waiting: Vec<String> = self
                    .consumers
                    .iter()
                    .filter(|(_, c)| c.media.is_none() && c.task.is_none())
                    .map(|(id, _)| id.clone())
                    .collect();
                for consumer in waiting {
                    self.start_consume(&consumer);
                }
            }
        }
        Ok(())
    }

    /// Everything built on a replaced transport is gone.
    fn on_transport_lost(&mut self, direction: TransportDirection) {
        match direction {
            TransportDirection::Send => {
                for entry in self.producers.values_mut() {
                    entry.reset();
                }
            }
            TransportDirection::Recv => {
                for (_, mut entry) in self.consumers.drain() {
                    entry.close();
                }
            }
        }
    }

    fn spawn_event_forwarder(
        &self,
        direction: TransportDirection,
        transport: String,
        mut events: TransportEvents,
        token: CancellationToken,
    ) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let message = Internal::Event {
                            direction,
                            transport: transport.clone(),
                            event,
                        };
                        if internal.send(message).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn on_connect_ack(&mut self, ack: &ConnectAck) {
        if !self.is_own(&ack.peer) {
            return;
        }
        let state = self.direction_mut(ack.direction);
        if !state.is_current(&ack.transport) {
            return;
        }
        if let Some(pending) = state.pending_connect.take() {
            let _ = pending.send(Ok(()));
        }
        state.phase = TransportPhase::Acknowledged;
        debug!(target: "client.connection", direction = ack.direction.as_str(), "Transport connected");
    }

    fn on_producer_server(&mut self, producer: &ProducerServer) {
        if !self.is_own(&producer.peer) {
            return;
        }
        let entry = self
            .producers
            .values_mut()
            .find(|p| p.producer_client.as_deref() == Some(producer.producer_client.as_str()));
        if let Some(entry) = entry {
            if let Some(pending) = entry.pending.take() {
                let _ = pending.send(Ok(producer.producer_id.clone()));
            }
        }
    }

    fn on_consumer(&mut self, consumer: Consumer) {
        if !self.is_own(&consumer.peer) {
            return;
        }
        let id = consumer.meta.id.clone();
        if let Some(entry) = self.consumers.get_mut(&id) {
            entry.record = consumer;
            self.apply_local_pause();
            return;
        }
        self.consumers.insert(
            id.clone(),
            ConsumerEntry {
                record: consumer,
                task: None,
                media: None,
            },
        );
        self.start_consume(&id);
    }

    fn start_produce(&mut self, track_id: &str) {
        let (Some(media), Some(transport)) = (self.send.media.clone(), self.send.record.clone())
        else {
            return;
        };
        let Some(entry) = self.producers.get_mut(track_id) else {
            return;
        };
        if entry.task.is_some() || entry.media.is_some() {
            return;
        }
        let track = entry.track.clone();
        let internal = self.internal_tx.clone();
        entry.transport = Some(transport.clone());
        entry.task = Some(tokio::spawn(async move {
            let result = media.produce(&track).await;
            let _ = internal.send(Internal::Produced {
                track_id: track.id,
                transport,
                result,
            });
        }));
    }

    fn start_consume(&mut self, consumer: &str) {
        let (Some(media), Some(transport)) = (self.recv.media.clone(), self.recv.record.clone())
        else {
            return;
        };
        let Some(entry) = self.consumers.get_mut(consumer) else {
            return;
        };
        if entry.record.transport != transport || entry.task.is_some() || entry.media.is_some() {
            return;
        }
        let record = entry.record.clone();
        let internal = self.internal_tx.clone();
        entry.task = Some(tokio::spawn(async move {
            let result = media.consume(&record).await;
            let _ = internal.send(Internal::Consumed {
                consumer: record.meta.id,
                transport,
                result,
            });
        }));
    }

    async fn on_internal(&mut self, internal: Internal) -> Result<(), ClientError> {
        match internal {
            Internal::Event {
                direction,
                transport,
                event,
            } => self.on_transport_event(direction, &transport, event).await,
            Internal::Produced {
                track_id,
                transport,
                result,
            } => {
                if !self.send.is_current(&transport) {
                    if let Ok(producer) = result {
                        producer.close();
                    }
                    return Ok(());
                }
                let producer = result?;
                match self.producers.get_mut(&track_id) {
                    Some(entry) => {
                        entry.task = None;
                        entry.media = Some(producer);
                        info!(target: "client.connection", track = %track_id, "Producing");
                    }
                    None => producer.close(),
                }
                self.apply_local_pause();
                Ok(())
            }
            Internal::Consumed {
                consumer,
                transport,
                result,
            } => {
                if !self.recv.is_current(&transport) {
                    if let Ok(media) = result {
                        media.close();
                    }
                    return Ok(());
                }
                let media = result?;
                let Some(entry) = self.consumers.get_mut(&consumer) else {
                    media.close();
                    return Ok(());
                };
                entry.task = None;
                entry.media = Some(media);
                self.apply_local_pause();
                let peer = self.peer_id()?;
                self.channel.ack_consumer(&peer, &consumer).await?;
                debug!(target: "client.connection", consumer = %consumer, "Consumer acknowledged");
                Ok(())
            }
        }
    }

    async fn on_transport_event(
        &mut self,
        direction: TransportDirection,
        transport: &str,
        event: TransportEvent,
    ) -> Result<(), ClientError> {
        if !self.direction(direction).is_current(transport) {
            reject_stale(event);
            return Ok(());
        }
        let peer = self.peer_id()?;
        match event {
            TransportEvent::Connect {
                dtls_parameters,
                callback,
            } => {
                let state = self.direction_mut(direction);
                if let Some(previous) = state.pending_connect.replace(callback) {
                    let _ = previous.send(Err(ClientError::Negotiation(
                        "connect raised twice".to_string(),
                    )));
                }
                state.phase = TransportPhase::ConnectRequested;
                self.channel
                    .connect_transport(&peer, transport, dtls_parameters)
                    .await
            }
            TransportEvent::Produce {
                track_id,
                kind,
                rtp_parameters,
                callback,
            } => {
                match self
                    .channel
                    .produce(&peer, transport, &track_id, kind, rtp_parameters)
                    .await
                {
                    Ok(producer) => {
                        match self.producers.get_mut(&track_id) {
                            Some(entry) => {
                                entry.producer_client = Some(producer.meta.id);
                                entry.pending = Some(callback);
                            }
                            None => {
                                // Track ended while the request was in flight.
                                let _ = self.channel.stop_producing(&producer.meta.id).await;
                                let _ = callback.send(Err(ClientError::Negotiation(
                                    "track ended".to_string(),
                                )));
                            }
                        }
                        Ok(())
                    }
                    Err(e) => {
                        let _ = callback.send(Err(e.clone()));
                        Err(e)
                    }
                }
            }
        }
    }

    fn on_tracks_changed(&mut self) -> Result<(), ClientError> {
        let tracks = self.tracks.borrow_and_update().clone();
        let wanted: HashSet<&str> = tracks.iter().map(|t| t.id.as_str()).collect();

        let ended: Vec<String> = self
            .producers
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        for id in ended {
            if let Some(mut entry) = self.producers.remove(&id) {
                let producer_client = entry.producer_client.take();
                entry.reset();
                if let Some(producer_client) = producer_client {
                    let channel = Arc::clone(&self.channel);
                    tokio::spawn(async move {
                        if let Err(e) = channel.stop_producing(&producer_client).await {
                            warn!(target: "client.connection", error = %e, "Failed to stop producing");
                        }
                    });
                }
                debug!(target: "client.connection", track = %id, "Track ended");
            }
        }

        for track in tracks {
            if !self.producers.contains_key(&track.id) {
                let id = track.id.clone();
                self.producers.insert(id.clone(), ProducerEntry::new(track));
                self.start_produce(&id);
            }
        }
        Ok(())
    }

    /// Effectively muted pauses our producers; deafened or a server-paused
    /// record pauses consumers.
    fn apply_local_pause(&mut self) {
        let muted = self.mute.effective().is_effectively_muted();
        for producer in self.producers.values().filter_map(|p| p.media.as_ref()) {
            match (muted, producer.is_paused()) {
                (true, false) => producer.pause(),
                (false, true) => producer.resume(),
                _ => {}
            }
        }
        let deafened = self.mute.desired().deafened;
        for entry in self.consumers.values() {
            if let Some(media) = &entry.media {
                let paused = deafened || entry.record.paused;
                match (paused, media.is_paused()) {
                    (true, false) => media.pause(),
                    (false, true) => media.resume(),
                    _ => {}
                }
            }
        }
    }

    /// Close every local media object and leave the call.
    async fn teardown(&mut self) -> Result<(), ClientError> {
        for entry in self.producers.values_mut() {
            entry.reset();
        }
        for (_, mut entry) in self.consumers.drain() {
            entry.close();
        }
        self.send.close();
        self.recv.close();
        match self.guard.take() {
            Some(guard) => guard.close().await,
            None => Ok(()),
        }
    }

    async fn fail(&mut self, error: &ClientError) {
        warn!(target: "client.connection", error = %error, "Connection failed");
        if let Err(e) = self.teardown().await {
            debug!(target: "client.connection", error = %e, "Leave after failure failed");
        }
        self.status = ConnectionStatus::Failed(error.to_string());
        self.last_error = Some(error.to_string());
        self.publish();
    }

    fn publish(&self) {
        let producers: Vec<&Arc<dyn MediaProducer>> =
            self.producers.values().filter_map(|p| p.media.as_ref()).collect();
        let consumers: Vec<&Arc<dyn MediaConsumer>> =
            self.consumers.values().filter_map(|c| c.media.as_ref()).collect();
        self.snapshot.send_replace(ConnectionSnapshot {
            status: self.status.clone(),
            peer: self.peer.clone(),
            others: self.others.values().cloned().collect(),
            desired: self.mute.desired(),
            effective: self.peer.as_ref().map(|_| self.mute.effective()),
            remote_mute_notice: self.mute.notice().cloned(),
            send: self.send.phase,
            recv: self.recv.phase,
            producers: producers.len(),
            paused_producers: producers.iter().filter(|p| p.is_paused()).count(),
            consumers: consumers.len(),
            paused_consumers: consumers.iter().filter(|c| c.is_paused()).count(),
            last_error: self.last_error.clone(),
        });
    }
}

fn reject_stale(event: TransportEvent) {
    let stale = || ClientError::Negotiation("transport replaced".to_string());
    match event {
        TransportEvent::Connect { callback, .. } => {
            let _ = callback.send(Err(stale()));
        }
        TransportEvent::Produce { callback, .. } => {
            let _ = callback.send(Err(stale()));
        }
    }
}
