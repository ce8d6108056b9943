//! Seams to the local media layer.
//!
//! Shaped after a WebRTC SFU client library: a device creates transports
//! from server-issued parameters; producing or consuming on a transport may
//! first raise a `Connect` event, and producing raises a `Produce` event
//! whose callback must be answered with the server's producer id before
//! `produce` returns.

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use crate::errors::ClientError;
use async_trait::async_trait;
use call_protocol::{
    Consumer, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, Transport,
    TransportDirection,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// A locally captured track. `id` is generated by the capture layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// A live capture stream. Its track list may change while captured.
#[derive(Debug)]
pub struct CaptureStream {
    tracks: watch::Receiver<Vec<LocalTrack>>,
    stopped: CancellationToken,
}

impl CaptureStream {
    #[must_use]
    pub fn new(tracks: watch::Receiver<Vec<LocalTrack>>, stopped: CancellationToken) -> Self {
        Self { tracks, stopped }
    }

    /// Watch the current track list.
    #[must_use]
    pub fn tracks(&self) -> watch::Receiver<Vec<LocalTrack>> {
        self.tracks.clone()
    }

    /// Release the capture device.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}

/// Playback context for received audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioContext {
    pub id: String,
}

/// Microphone access.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// # Errors
    ///
    /// `ClientError::Capture` when the microphone is unavailable or denied.
    async fn acquire_audio(&self) -> Result<CaptureStream, ClientError>;

    /// # Errors
    ///
    /// `ClientError::Capture` when no playback context can be created.
    async fn create_audio_context(&self) -> Result<AudioContext, ClientError>;
}

/// Raised by a transport while it needs the application's help.
pub enum TransportEvent {
    /// DTLS is ready locally; resolve once the server confirms the connect.
    Connect {
        dtls_parameters: DtlsParameters,
        callback: oneshot::Sender<Result<(), ClientError>>,
    },
    /// A track wants to be published; resolve with the server's producer id.
    Produce {
        track_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        callback: oneshot::Sender<Result<String, ClientError>>,
    },
}

/// Transport events, in the order the transport raised them.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Local SFU client device.
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Receive capabilities sent with the transport request.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Build a local transport from server-issued parameters.
    ///
    /// # Errors
    ///
    /// `ClientError::Negotiation` when the parameters are unusable.
    async fn create_transport(
        &self,
        direction: TransportDirection,
        params: &Transport,
    ) -> Result<(Arc<dyn MediaTransport>, TransportEvents), ClientError>;
}

/// A local send or recv transport.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// SFU transport id this transport was built from.
    fn id(&self) -> &str;

    /// Publish a track. Raises `Connect` (first use) and `Produce`.
    ///
    /// # Errors
    ///
    /// `ClientError::Negotiation` when a callback is rejected or dropped.
    async fn produce(&self, track: &LocalTrack) -> Result<Arc<dyn MediaProducer>, ClientError>;

    /// Receive a track described by a server-written Consumer record.
    /// Raises `Connect` on first use.
    ///
    /// # Errors
    ///
    /// `ClientError::Negotiation` when connecting fails.
    async fn consume(&self, consumer: &Consumer) -> Result<Arc<dyn MediaConsumer>, ClientError>;

    fn close(&self);
}

/// A published track.
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &str;
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
}

/// A received track.
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
}
