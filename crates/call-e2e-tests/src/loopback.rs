//! The client's channel, bound directly to one server's `CallService`.

use async_trait::async_trait;
use call_client::{CallChannel, ChannelSubscription, ClientError, SubscriptionGuard};
use call_controller::errors::{CallError, ErrorClass};
use call_controller::service::{CallService, LeaveGuard};
use call_protocol::{
    DesiredPeerState, DtlsParameters, JoinRequest, MediaKind, ProducerClient, RtpCapabilities,
    RtpParameters, TransportRequest,
};
use common::types::{PeerId, UserId};

/// A signed-in user talking to one server.
#[derive(Clone)]
pub struct LoopbackChannel {
    service: CallService,
    user: UserId,
}

impl LoopbackChannel {
    pub fn new(service: CallService, user: UserId) -> Self {
        Self { service, user }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }
}

/// Map a server error onto the client's taxonomy.
pub fn client_error(error: CallError) -> ClientError {
    match error.class() {
        ErrorClass::Negotiation => ClientError::Negotiation(error.to_string()),
        ErrorClass::Authorization => ClientError::Authorization(error.client_message()),
        ErrorClass::RaceLoss | ErrorClass::Internal => ClientError::Rejected(error.to_string()),
    }
}

struct LoopbackGuard(LeaveGuard);

#[async_trait]
impl SubscriptionGuard for LoopbackGuard {
    async fn close(self: Box<Self>) -> Result<(), ClientError> {
        self.0.close().await.map(|_| ()).map_err(client_error)
    }
}

#[async_trait]
impl CallChannel for LoopbackChannel {
    async fn join(&self, request: JoinRequest) -> Result<ChannelSubscription, ClientError> {
        let subscription = self
            .service
            .join(&self.user, request)
            .await
            .map_err(client_error)?;
        Ok(ChannelSubscription {
            peer: subscription.peer,
            records: subscription.records,
            feed: subscription.feed,
            guard: Box::new(LoopbackGuard(subscription.guard)),
        })
    }

    async fn request_transports(
        &self,
        peer: &PeerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<TransportRequest, ClientError> {
        self.service
            .request_transports(&self.user, peer, rtp_capabilities)
            .await
            .map_err(client_error)
    }

    async fn release_transports(&self, request: &str) -> Result<(), ClientError> {
        self.service
            .release_transports(&self.user, request)
            .await
            .map_err(client_error)
    }

    async fn connect_transport(
        &self,
        peer: &PeerId,
        transport: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ClientError> {
        self.service
            .connect_transport(&self.user, peer, transport, dtls_parameters)
            .await
            .map(|_| ())
            .map_err(client_error)
    }

    async fn produce(
        &self,
        peer: &PeerId,
        transport: &str,
        track_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerClient, ClientError> {
        self.service
            .produce(&self.user, peer, transport, track_id, kind, rtp_parameters)
            .await
            .map_err(client_error)
    }

    async fn stop_producing(&self, producer: &str) -> Result<(), ClientError> {
        self.service
            .stop_producing(&self.user, producer)
            .await
            .map_err(client_error)
    }

    async fn ack_consumer(&self, peer: &PeerId, consumer: &str) -> Result<(), ClientError> {
        self.service
            .ack_consumer(&self.user, peer, consumer)
            .await
            .map_err(client_error)
    }

    async fn set_peer_state(
        &self,
        peer: &PeerId,
        desired: DesiredPeerState,
    ) -> Result<(), ClientError> {
        self.service
            .set_peer_state(&self.user, peer, desired)
            .await
            .map(|_| ())
            .map_err(client_error)
    }

    async fn ack_remote_mute(&self, peer: &PeerId) -> Result<(), ClientError> {
        self.service
            .ack_remote_mute(&self.user, peer)
            .await
            .map(|_| ())
            .map_err(client_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_controller::store::StoreError;
    use call_protocol::Collection;

    #[test]
    fn test_error_classes_map_to_client_taxonomy() {
        assert!(matches!(
            client_error(CallError::NotAMember("h".to_string())),
            ClientError::Authorization(_)
        ));
        assert!(matches!(
            client_error(CallError::Conflict("dup".to_string())),
            ClientError::Rejected(_)
        ));
        assert!(matches!(
            client_error(CallError::Store(StoreError::DuplicateKey {
                collection: Collection::Peers,
                key: "k".to_string(),
            })),
            ClientError::Rejected(_)
        ));
    }
}
