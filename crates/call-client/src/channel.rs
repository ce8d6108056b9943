//! Client view of the reactive channel.
//!
//! A channel is scoped to one signed-in user. `join` opens the call's
//! subscription: the server attaches a Peer and returns the call's visible
//! records plus an ordered feed of changes. The returned guard owns the Peer
//! and must be closed exactly once. Every other method is a one-shot command
//! that resolves or fails once.

use crate::errors::ClientError;
use async_trait::async_trait;
use call_protocol::{
    ChangeFeed, DesiredPeerState, DtlsParameters, JoinRequest, MediaKind, Peer, ProducerClient,
    Record, RtpCapabilities, RtpParameters, TransportRequest,
};
use common::types::PeerId;

/// Owns a joined Peer on the server.
#[async_trait]
pub trait SubscriptionGuard: Send {
    /// Leave the call.
    ///
    /// # Errors
    ///
    /// Returns the server's error; the Peer is still reaped eventually.
    async fn close(self: Box<Self>) -> Result<(), ClientError>;
}

/// An open call subscription.
pub struct ChannelSubscription {
    pub peer: Peer,
    pub records: Vec<Record>,
    pub feed: ChangeFeed,
    pub guard: Box<dyn SubscriptionGuard>,
}

#[async_trait]
pub trait CallChannel: Send + Sync {
    async fn join(&self, request: JoinRequest) -> Result<ChannelSubscription, ClientError>;

    async fn request_transports(
        &self,
        peer: &PeerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<TransportRequest, ClientError>;

    async fn release_transports(&self, request: &str) -> Result<(), ClientError>;

    async fn connect_transport(
        &self,
        peer: &PeerId,
        transport: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ClientError>;

    async fn produce(
        &self,
        peer: &PeerId,
        transport: &str,
        track_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerClient, ClientError>;

    async fn stop_producing(&self, producer: &str) -> Result<(), ClientError>;

    async fn ack_consumer(&self, peer: &PeerId, consumer: &str) -> Result<(), ClientError>;

    async fn set_peer_state(
        &self,
        peer: &PeerId,
        desired: DesiredPeerState,
    ) -> Result<(), ClientError>;

    async fn ack_remote_mute(&self, peer: &PeerId) -> Result<(), ClientError>;
}
