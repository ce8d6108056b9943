//! Bookkeeping SFU with no media plane.
//!
//! Tracks routers, transports, producers and consumers so that routing logic
//! can run against it in development and tests. Individual operations can be
//! made to fail on demand.

use super::{ConsumerParams, SfuClient, SfuError, TransportParams};
use async_trait::async_trait;
use call_protocol::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportDirection};
use common::types::CallId;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SfuOperation {
    CreateRouter,
    CreateTransport,
    ConnectTransport,
    Produce,
    Consume,
    ResumeConsumer,
}

struct TransportState {
    router: String,
    direction: TransportDirection,
    connected: bool,
}

struct ProducerState {
    transport: String,
    kind: MediaKind,
}

struct ConsumerState {
    transport: String,
    producer: String,
    paused: bool,
}

#[derive(Default)]
struct State {
    routers: HashMap<String, CallId>,
    transports: HashMap<String, TransportState>,
    producers: HashMap<String, ProducerState>,
    consumers: HashMap<String, ConsumerState>,
    failing: HashSet<SfuOperation>,
}

impl State {
    fn check(&self, op: SfuOperation, name: &'static str) -> Result<(), SfuError> {
        if self.failing.contains(&op) {
            return Err(SfuError::Failed {
                op: name,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn drop_transport(&mut self, transport_id: &str) {
        self.transports.remove(transport_id);
        let producers: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in producers {
            self.drop_producer(&id);
        }
        self.consumers.retain(|_, c| c.transport != transport_id);
    }

    fn drop_producer(&mut self, producer_id: &str) {
        self.producers.remove(producer_id);
        self.consumers.retain(|_, c| c.producer != producer_id);
    }
}

/// Counts of live SFU objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SfuStats {
    pub routers: usize,
    pub transports: usize,
    pub connected_transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub paused_consumers: usize,
}

/// In-process SFU.
#[derive(Clone, Default)]
pub struct InProcessSfu {
    state: Arc<Mutex<State>>,
}

impl InProcessSfu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, SfuError> {
        self.state.lock().map_err(|_| SfuError::Failed {
            op: "lock",
            reason: "in-process SFU mutex poisoned".to_string(),
        })
    }

    /// Make every subsequent `op` fail until [`InProcessSfu::heal`].
    pub fn fail(&self, op: SfuOperation) {
        if let Ok(mut state) = self.lock() {
            state.failing.insert(op);
        }
    }

    /// Stop failing `op`.
    pub fn heal(&self, op: SfuOperation) {
        if let Ok(mut state) = self.lock() {
            state.failing.remove(&op);
        }
    }

    /// Counts of live objects.
    #[must_use]
    pub fn stats(&self) -> SfuStats {
        let Ok(state) = self.lock() else {
            return SfuStats::default();
        };
        SfuStats {
            routers: state.routers.len(),
            transports: state.transports.len(),
            connected_transports: state.transports.values().filter(|t| t.connected).count(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
            paused_consumers: state.consumers.values().filter(|c| c.paused).count(),
        }
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[async_trait]
impl SfuClient for InProcessSfu {
    async fn create_router(&self, call: &CallId) -> Result<String, SfuError> {
        let mut state = self.lock()?;
        state.check(SfuOperation::CreateRouter, "create_router")?;
        let id = new_id("router");
        state.routers.insert(id.clone(), call.clone());
        Ok(id)
    }

    async fn close_router(&self, router_id: &str) -> Result<(), SfuError> {
        let mut state = self.lock()?;
        if state.routers.remove(router_id).is_none() {
            return Err(SfuError::UnknownObject {
                kind: "router",
                id: router_id.to_string(),
            });
        }
        let transports: Vec<String> = state
            .transports
            .iter()
            .filter(|(_, t)| t.router == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in transports {
            state.drop_transport(&id);
        }
        Ok(())
    }

    async fn create_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportParams, SfuError> {
        let mut state = self.lock()?;
        state.check(SfuOperation::CreateTransport, "create_transport")?;
        if !state.routers.contains_key(router_id) {
            return Err(SfuError::UnknownObject {
                kind: "router",
                id: router_id.to_string(),
            });
        }
        let transport_id = new_id("transport");
        state.transports.insert(
            transport_id.clone(),
            TransportState {
                router: router_id.to_string(),
                direction,
                connected: false,
            },
        );
        Ok(TransportParams {
            ice_parameters: json!({
                "usernameFragment": new_id("ufrag"),
                "password": new_id("pwd"),
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "protocol": "udp",
                "ip": "127.0.0.1",
                "port": 40000,
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{"algorithm": "sha-256", "value": transport_id}],
            }),
            transport_id,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), SfuError> {
        let mut state = self.lock()?;
        state.check(SfuOperation::ConnectTransport, "connect_transport")?;
        if !dtls_parameters.is_object() {
            return Err(SfuError::Failed {
                op: "connect_transport",
                reason: "malformed DTLS parameters".to_string(),
            });
        }
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| SfuError::UnknownObject {
                kind: "transport",
                id: transport_id.to_string(),
            })?;
        if transport.connected {
            return Err(SfuError::Failed {
                op: "connect_transport",
                reason: "transport already connected".to_string(),
            });
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), SfuError> {
        let mut state = self.lock()?;
        if !state.transports.contains_key(transport_id) {
            return Err(SfuError::UnknownObject {
                kind: "transport",
                id: transport_id.to_string(),
            });
        }
        state.drop_transport(transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, SfuError> {
        let mut state = self.lock()?;
        state.check(SfuOperation::Produce, "produce")?;
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| SfuError::UnknownObject {
                kind: "transport",
                id: transport_id.to_string(),
            })?;
        if transport.direction != TransportDirection::Send || !transport.connected {
            return Err(SfuError::Failed {
                op: "produce",
                reason: "transport is not a connected send transport".to_string(),
            });
        }
        if rtp_parameters.is_null() {
            return Err(SfuError::Failed {
                op: "produce",
                reason: "missing RTP parameters".to_string(),
            });
        }
        let id = new_id("producer");
        state.producers.insert(
            id.clone(),
            ProducerState {
                transport: transport_id.to_string(),
                kind,
            },
        );
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), SfuError> {
        let mut state = self.lock()?;
        if !state.producers.contains_key(producer_id) {
            return Err(SfuError::UnknownObject {
                kind: "producer",
                id: producer_id.to_string(),
            });
        }
        state.drop_producer(producer_id);
        Ok(())
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerParams, SfuError> {
        let mut state = self.lock()?;
        state.check(SfuOperation::Consume, "consume")?;
        let kind = state
            .producers
            .get(producer_id)
            .map(|p| p.kind)
            .ok_or_else(|| SfuError::UnknownObject {
                kind: "producer",
                id: producer_id.to_string(),
            })?;
        match state.transports.get(transport_id) {
            Some(t) if t.direction == TransportDirection::Recv => {}
            Some(_) => {
                return Err(SfuError::Failed {
                    op: "consume",
                    reason: "transport is not a recv transport".to_string(),
                })
            }
            None => {
                return Err(SfuError::UnknownObject {
                    kind: "transport",
                    id: transport_id.to_string(),
                })
            }
        }
        let consumer_id = new_id("consumer");
        state.consumers.insert(
            consumer_id.clone(),
            ConsumerState {
                transport: transport_id.to_string(),
                producer: producer_id.to_string(),
                paused: true,
            },
        );
        Ok(ConsumerParams {
            consumer_id,
            kind,
            rtp_parameters: json!({
                "codecs": [{"mimeType": "audio/opus", "clockRate": 48000, "channels": 2}],
                "encodings": [{"ssrc": 1111}],
            }),
        })
    }

    async fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> Result<(), SfuError> {
        let mut state = self.lock()?;
        if !paused {
            state.check(SfuOperation::ResumeConsumer, "resume_consumer")?;
        }
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SfuError::UnknownObject {
                kind: "consumer",
                id: consumer_id.to_string(),
            })?;
        consumer.paused = paused;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), SfuError> {
        let mut state = self.lock()?;
        if state.consumers.remove(consumer_id).is_none() {
            return Err(SfuError::UnknownObject {
                kind: "consumer",
                id: consumer_id.to_string(),
            });
        }
        Ok(())
    }
}
