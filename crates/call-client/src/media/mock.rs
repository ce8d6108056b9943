//! In-memory media layer for tests.
//!
//! Transports raise the same events, in the same order, as a real SFU client
//! device would, so the negotiation code under test cannot tell the
//! difference. No audio is captured or played.

use super::{
    AudioContext, CaptureStream, LocalTrack, MediaCapture, MediaConsumer, MediaDevice,
    MediaProducer, MediaTransport, TransportEvent, TransportEvents,
};
use crate::errors::ClientError;
use async_trait::async_trait;
use call_protocol::{Consumer, MediaKind, RtpCapabilities, Transport, TransportDirection};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct CaptureState {
    failure: Option<String>,
    current: Option<watch::Sender<Vec<LocalTrack>>>,
    streams: Vec<CancellationToken>,
}

/// Microphone that hands out one audio track per acquisition.
#[derive(Clone, Default)]
pub struct MockMediaCapture {
    state: Arc<Mutex<CaptureState>>,
    contexts: Arc<AtomicUsize>,
}

impl MockMediaCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later acquisition fail with `reason`.
    pub fn deny(&self, reason: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = Some(reason.to_string());
        }
    }

    pub fn allow(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = None;
        }
    }

    /// Add a track to the most recent stream. Returns its id.
    pub fn add_track(&self) -> Option<String> {
        let state = self.state.lock().ok()?;
        let sender = state.current.as_ref()?;
        let track = LocalTrack {
            id: format!("track-{}", Uuid::new_v4().simple()),
            kind: MediaKind::Audio,
        };
        let id = track.id.clone();
        sender.send_modify(|tracks| tracks.push(track));
        Some(id)
    }

    /// Remove a track from the most recent stream.
    pub fn remove_track(&self, id: &str) {
        if let Ok(state) = self.state.lock() {
            if let Some(sender) = &state.current {
                sender.send_modify(|tracks| tracks.retain(|t| t.id != id));
            }
        }
    }

    /// Streams handed out and not yet stopped.
    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.streams.iter().filter(|t| !t.is_cancelled()).count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn contexts_created(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for MockMediaCapture {
    async fn acquire_audio(&self) -> Result<CaptureStream, ClientError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ClientError::Capture("capture state poisoned".to_string()))?;
        if let Some(reason) = &state.failure {
            return Err(ClientError::Capture(reason.clone()));
        }
        let (sender, receiver) = watch::channel(vec![LocalTrack {
            id: format!("track-{}", Uuid::new_v4().simple()),
            kind: MediaKind::Audio,
        }]);
        let stopped = CancellationToken::new();
        state.current = Some(sender);
        state.streams.push(stopped.clone());
        Ok(CaptureStream::new(receiver, stopped))
    }

    async fn create_audio_context(&self) -> Result<AudioContext, ClientError> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(AudioContext {
            id: format!("ctx-{}", Uuid::new_v4().simple()),
        })
    }
}

/// Counts of live local media objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockMediaStats {
    pub transports: usize,
    pub producers: usize,
    pub paused_producers: usize,
    pub consumers: usize,
    pub paused_consumers: usize,
}

#[derive(Default)]
struct DeviceState {
    transports: Vec<Arc<MockTransport>>,
    producers: Vec<Arc<MockTrackHandle>>,
    consumers: Vec<Arc<MockTrackHandle>>,
}

/// Device building [`MockTransport`]s.
#[derive(Clone, Default)]
pub struct MockMediaDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockMediaDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stats(&self) -> MockMediaStats {
        let Ok(state) = self.state.lock() else {
            return MockMediaStats::default();
        };
        let live = |handles: &[Arc<MockTrackHandle>]| {
            handles.iter().filter(|h| !h.closed.load(Ordering::SeqCst)).count()
        };
        let paused = |handles: &[Arc<MockTrackHandle>]| {
            handles
                .iter()
                .filter(|h| !h.closed.load(Ordering::SeqCst) && h.paused.load(Ordering::SeqCst))
                .count()
        };
        MockMediaStats {
            transports: state
                .transports
                .iter()
                .filter(|t| !t.closed.load(Ordering::SeqCst))
                .count(),
            producers: live(&state.producers),
            paused_producers: paused(&state.producers),
            consumers: live(&state.consumers),
            paused_consumers: paused(&state.consumers),
        }
    }
}

#[async_trait]
impl MediaDevice for MockMediaDevice {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000}]})
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        params: &Transport,
    ) -> Result<(Arc<dyn MediaTransport>, TransportEvents), ClientError> {
        if !params.dtls_parameters.is_object() || !params.ice_parameters.is_object() {
            return Err(ClientError::Negotiation(
                "transport parameters are malformed".to_string(),
            ));
        }
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            id: params.transport_id.clone(),
            direction,
            events,
            connected: tokio::sync::Mutex::new(false),
            closed: AtomicBool::new(false),
            device: self.clone(),
        });
        if let Ok(mut state) = self.state.lock() {
            state.transports.push(Arc::clone(&transport));
        }
        Ok((transport as Arc<dyn MediaTransport>, receiver))
    }
}

/// Transport that raises real-looking events.
pub struct MockTransport {
    id: String,
    direction: TransportDirection,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: tokio::sync::Mutex<bool>,
    closed: AtomicBool,
    device: MockMediaDevice,
}

impl MockTransport {
    async fn ensure_connected(&self) -> Result<(), ClientError> {
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(());
        }
        let (callback, result) = oneshot::channel();
        self.events
            .send(TransportEvent::Connect {
                dtls_parameters: json!({
                    "role": "client",
                    "fingerprints": [{"algorithm": "sha-256", "value": self.id}],
                }),
                callback,
            })
            .map_err(|_| ClientError::Negotiation("transport events closed".to_string()))?;
        result
            .await
            .map_err(|_| ClientError::Negotiation("connect abandoned".to_string()))??;
        *connected = true;
        Ok(())
    }

    fn check_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Negotiation("transport closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(&self, track: &LocalTrack) -> Result<Arc<dyn MediaProducer>, ClientError> {
        self.check_open()?;
        if self.direction != TransportDirection::Send {
            return Err(ClientError::Negotiation(
                "cannot produce on a recv transport".to_string(),
            ));
        }
        self.ensure_connected().await?;

        let (callback, result) = oneshot::channel();
        self.events
            .send(TransportEvent::Produce {
                track_id: track.id.clone(),
                kind: track.kind,
                rtp_parameters: json!({
                    "mid": track.id,
                    "codecs": [{"mimeType": "audio/opus", "clockRate": 48000, "channels": 2}],
                }),
                callback,
            })
            .map_err(|_| ClientError::Negotiation("transport events closed".to_string()))?;
        let producer_id = result
            .await
            .map_err(|_| ClientError::Negotiation("produce abandoned".to_string()))??;

        let handle = Arc::new(MockTrackHandle::new(producer_id));
        if let Ok(mut state) = self.device.state.lock() {
            state.producers.push(Arc::clone(&handle));
        }
        Ok(handle as Arc<dyn MediaProducer>)
    }

    async fn consume(&self, consumer: &Consumer) -> Result<Arc<dyn MediaConsumer>, ClientError> {
        self.check_open()?;
        if self.direction != TransportDirection::Recv {
            return Err(ClientError::Negotiation(
                "cannot consume on a send transport".to_string(),
            ));
        }
        self.ensure_connected().await?;

        let handle = Arc::new(MockTrackHandle::new(consumer.consumer_id.clone()));
        if let Ok(mut state) = self.device.state.lock() {
            state.consumers.push(Arc::clone(&handle));
        }
        Ok(handle as Arc<dyn MediaConsumer>)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Producer or consumer handle.
pub struct MockTrackHandle {
    id: String,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl MockTrackHandle {
    fn new(id: String) -> Self {
        Self {
            id,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

impl MediaProducer for MockTrackHandle {
    fn id(&self) -> &str {
        &self.id
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MediaConsumer for MockTrackHandle {
    fn id(&self) -> &str {
        &self.id
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use call_protocol::DocMeta;
    use common::types::{CallId, HuntId, PeerId, ServerId, UserId};

    fn transport_params(direction: TransportDirection) -> Transport {
        Transport {
            meta: DocMeta::new(&UserId::from("cc-1")),
            created_server: ServerId::from("cc-1"),
            hunt: HuntId::from("h"),
            call: CallId::from("c"),
            peer: PeerId::from("p"),
            transport_request: "r".to_string(),
            direction,
            transport_id: format!("sfu-{}", direction.as_str()),
            ice_parameters: json!({"usernameFragment": "u"}),
            ice_candidates: json!([]),
            dtls_parameters: json!({"role": "auto"}),
        }
    }

    #[tokio::test]
    async fn test_produce_raises_connect_then_produce() {
        let device = MockMediaDevice::new();
        let (transport, mut events) = device
            .create_transport(
                TransportDirection::Send,
                &transport_params(TransportDirection::Send),
            )
            .await
            .unwrap();

        let track = LocalTrack {
            id: "t1".to_string(),
            kind: MediaKind::Audio,
        };
        let producing = tokio::spawn(async move { transport.produce(&track).await });

        match events.recv().await.unwrap() {
            TransportEvent::Connect { callback, .. } => callback.send(Ok(())).unwrap(),
            TransportEvent::Produce { .. } => panic!("connect must come first"),
        }
        match events.recv().await.unwrap() {
            TransportEvent::Produce {
                track_id, callback, ..
            } => {
                assert_eq!(track_id, "t1");
                callback.send(Ok("prod-1".to_string())).unwrap();
            }
            TransportEvent::Connect { .. } => panic!("connected twice"),
        }

        let producer = producing.await.unwrap().unwrap();
        assert_eq!(producer.id(), "prod-1");
        assert_eq!(device.stats().producers, 1);
    }

    #[tokio::test]
    async fn test_rejected_connect_fails_produce() {
        let device = MockMediaDevice::new();
        let (transport, mut events) = device
            .create_transport(
                TransportDirection::Send,
                &transport_params(TransportDirection::Send),
            )
            .await
            .unwrap();
        let track = LocalTrack {
            id: "t1".to_string(),
            kind: MediaKind::Audio,
        };
        let producing = tokio::spawn(async move { transport.produce(&track).await });
        if let TransportEvent::Connect { callback, .. } = events.recv().await.unwrap() {
            callback
                .send(Err(ClientError::Negotiation("nope".to_string())))
                .unwrap();
        }
        assert!(producing.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_capture_denied() {
        let capture = MockMediaCapture::new();
        capture.deny("permission denied");
        let err = capture.acquire_audio().await.unwrap_err();
        assert!(matches!(err, ClientError::Capture(_)));
    }
}
