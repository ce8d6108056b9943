//! SFU client seam.
//!
//! The orchestration layer only needs routers, transports, producers and
//! consumers with pause/resume/close. Parameters stay opaque JSON.

mod in_process;

pub use in_process::{InProcessSfu, SfuOperation, SfuStats};

use async_trait::async_trait;
use call_protocol::{
    DtlsParameters, IceCandidates, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportDirection,
};
use common::types::CallId;
use thiserror::Error;

/// SFU errors.
#[derive(Debug, Error)]
pub enum SfuError {
    /// The SFU rejected or failed an operation.
    #[error("SFU {op} failed: {reason}")]
    Failed { op: &'static str, reason: String },

    /// The referenced SFU object does not exist (or was closed).
    #[error("unknown SFU {kind}: {id}")]
    UnknownObject { kind: &'static str, id: String },
}

/// Server-side parameters of a newly created transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub transport_id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

/// Server-side parameters of a newly created consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerParams {
    pub consumer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Client for one SFU service.
#[async_trait]
pub trait SfuClient: Send + Sync {
    /// Create a router for one call. Returns the router id.
    async fn create_router(&self, call: &CallId) -> Result<String, SfuError>;

    /// Close a router and everything created on it.
    async fn close_router(&self, router_id: &str) -> Result<(), SfuError>;

    async fn create_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportParams, SfuError>;

    /// Complete DTLS with the client's parameters.
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), SfuError>;

    async fn close_transport(&self, transport_id: &str) -> Result<(), SfuError>;

    /// Create a producer on a send transport. Returns the producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, SfuError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), SfuError>;

    /// Create a paused consumer of `producer_id` on a recv transport.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerParams, SfuError>;

    async fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> Result<(), SfuError>;

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), SfuError>;
}
