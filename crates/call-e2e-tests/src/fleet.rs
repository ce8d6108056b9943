//! Test fleet: several call servers sharing one store.

use crate::eventual::{snapshot_eventually, Settle};
use crate::loopback::LoopbackChannel;
use call_client::media::mock::{MockMediaCapture, MockMediaDevice};
use call_client::media::{CaptureStream, MediaCapture};
use call_client::{CallConnection, CallSession, ClientError, ConnectionSnapshot, ConnectionStatus};
use call_controller::auth::{Authorizer, StaticMembership};
use call_controller::config::Config;
use call_controller::errors::CallError;
use call_controller::locks::{LockConfig, LockManager};
use call_controller::service::CallService;
use call_controller::sfu::InProcessSfu;
use call_controller::store::{DocumentStore, DocumentStoreExt, Filter, MemoryStore, StoreError};
use call_controller::tasks::{self, ReapReport};
use call_protocol::{Collection, DesiredPeerState, Document, JoinRequest, Peer, Room, ServerRecord};
use common::types::{CallId, HuntId, ServerId, TabId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Hunt every fleet call belongs to.
pub const HUNT: &str = "hunt-1";

/// One running call server.
pub struct TestCallServer {
    pub service: CallService,
    pub sfu: InProcessSfu,
}

impl TestCallServer {
    pub fn id(&self) -> &ServerId {
        self.service.server_id()
    }

    /// A channel for `user` attached to this server.
    pub fn channel(&self, user: &str) -> Arc<LoopbackChannel> {
        Arc::new(LoopbackChannel::new(
            self.service.clone(),
            UserId::from(user),
        ))
    }

    /// A negotiating client for `user`, joined to `call` from `tab`.
    pub async fn join(
        &self,
        user: &str,
        call: &str,
        tab: &str,
        desired: Option<DesiredPeerState>,
    ) -> TestParticipant {
        let capture = MockMediaCapture::new();
        let device = MockMediaDevice::new();
        let stream = match capture.acquire_audio().await {
            Ok(stream) => stream,
            Err(e) => panic!("mock capture failed: {e}"),
        };
        let mut request =
            JoinRequest::new(HuntId::from(HUNT), CallId::from(call), TabId::from(tab));
        request.desired = desired;
        let connection = CallConnection::spawn(
            self.channel(user),
            Arc::new(device.clone()),
            request,
            stream.tracks(),
        );
        let snapshot = connection.snapshot();
        TestParticipant {
            capture,
            device,
            stream,
            connection,
            snapshot,
        }
    }

    /// A full client session for `user`, with its own mock microphone.
    pub fn session(&self, user: &str) -> (CallSession, MockMediaCapture, MockMediaDevice) {
        let capture = MockMediaCapture::new();
        let device = MockMediaDevice::new();
        let session = CallSession::new(
            Arc::new(capture.clone()),
            Arc::new(device.clone()),
            self.channel(user),
        );
        (session, capture, device)
    }
}

/// A joined client with a mock microphone and media device.
pub struct TestParticipant {
    pub capture: MockMediaCapture,
    pub device: MockMediaDevice,
    pub stream: CaptureStream,
    pub connection: CallConnection,
    pub snapshot: watch::Receiver<ConnectionSnapshot>,
}

impl TestParticipant {
    /// Wait for a snapshot matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns the last snapshot seen on timeout.
    pub async fn until(
        &mut self,
        predicate: impl FnMut(&ConnectionSnapshot) -> bool,
    ) -> Result<ConnectionSnapshot, String> {
        snapshot_eventually(&mut self.snapshot, Settle::Negotiation, predicate).await
    }

    /// Fully negotiated: producing and hearing `others` remote producers.
    ///
    /// # Errors
    ///
    /// Returns the last snapshot seen on timeout.
    pub async fn until_hearing(&mut self, others: usize) -> Result<ConnectionSnapshot, String> {
        self.until(|s| {
            s.producers == 1
                && s.consumers == others
                && s.paused_consumers == 0
                && s.status == ConnectionStatus::Connected
        })
        .await
    }

    /// Stop the microphone and leave.
    ///
    /// # Errors
    ///
    /// Returns the server's error from leaving.
    pub async fn leave(self) -> Result<(), ClientError> {
        self.stream.stop();
        self.connection.leave().await
    }
}

/// Timings short enough for tests, long enough that nothing background
/// fires unless a test waits for it.
pub fn test_config(server: &str) -> Config {
    let mut config = Config::for_server(ServerId::from(server));
    config.lock_preempt = Duration::from_secs(2);
    config.lock_renew = Duration::from_millis(50);
    config.heartbeat_interval = Duration::from_secs(60);
    config.server_timeout = Duration::from_secs(300);
    config.gc_interval = Duration::from_secs(600);
    config
}

/// Servers sharing a store and a membership table.
pub struct TestFleet {
    pub store: Arc<MemoryStore>,
    pub membership: StaticMembership,
    servers: Vec<TestCallServer>,
}

impl TestFleet {
    /// Start `count` servers named `cc-0`, `cc-1`, ...
    ///
    /// # Errors
    ///
    /// Returns the first server's start error.
    pub async fn spawn(count: usize) -> Result<Self, CallError> {
        Self::spawn_with(count, |_| {}).await
    }

    /// Like [`TestFleet::spawn`], adjusting each server's config first.
    ///
    /// # Errors
    ///
    /// Returns the first server's start error.
    pub async fn spawn_with(
        count: usize,
        configure: impl Fn(&mut Config),
    ) -> Result<Self, CallError> {
        let mut fleet = Self {
            store: Arc::new(MemoryStore::new()),
            membership: StaticMembership::new(),
            servers: Vec::with_capacity(count),
        };
        for i in 0..count {
            let mut config = test_config(&format!("cc-{i}"));
            configure(&mut config);
            fleet.add_server(config).await?;
        }
        Ok(fleet)
    }

    /// Start one more server.
    ///
    /// # Errors
    ///
    /// Returns the start error.
    pub async fn add_server(&mut self, config: Config) -> Result<&TestCallServer, CallError> {
        let sfu = InProcessSfu::new();
        let store: Arc<dyn DocumentStore> = self.store.clone();
        let authorizer: Arc<dyn Authorizer> = Arc::new(self.membership.clone());
        let service = CallService::start(config, store, Arc::new(sfu.clone()), authorizer).await?;
        self.servers.push(TestCallServer { service, sfu });
        let index = self.servers.len() - 1;
        Ok(&self.servers[index])
    }

    pub fn server(&self, index: usize) -> &TestCallServer {
        &self.servers[index]
    }

    /// Let `user` into the fleet's hunt.
    pub fn admit(&self, user: &str) {
        self.membership
            .grant(&HuntId::from(HUNT), &UserId::from(user));
    }

    pub async fn rooms(&self, call: &str) -> Vec<Room> {
        self.find(Filter::collection(Collection::Rooms).in_call(&CallId::from(call)))
            .await
    }

    pub async fn peers(&self, call: &str) -> Vec<Peer> {
        self.find(Filter::collection(Collection::Peers).in_call(&CallId::from(call)))
            .await
    }

    pub async fn server_records(&self) -> Vec<ServerRecord> {
        self.find(Filter::collection(Collection::Servers)).await
    }

    async fn find<D: Document>(&self, filter: Filter) -> Vec<D> {
        self.store.find_docs(filter).await.unwrap_or_default()
    }

    /// Run one reap pass as `server`.
    ///
    /// # Errors
    ///
    /// Returns reaper errors.
    pub async fn reap_from(
        &self,
        server: &ServerId,
        server_timeout: Duration,
    ) -> Result<ReapReport, CallError> {
        let store: Arc<dyn DocumentStore> = self.store.clone();
        let locks = LockManager::new(
            Arc::clone(&store),
            server,
            LockConfig {
                preempt: Duration::from_secs(2),
                renew: Duration::from_millis(50),
            },
        );
        tasks::run_reap(store.as_ref(), &locks, server, server_timeout).await
    }

    /// Insert records as they would be left behind by a crashed server.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn insert_raw<D: Document>(&self, doc: D) -> Result<D, StoreError> {
        self.store.insert_doc(doc).await
    }

    /// Shut every server down cleanly.
    pub async fn shutdown(&self) {
        for server in &self.servers {
            if let Err(e) = server.service.shutdown().await {
                tracing::warn!(target: "e2e.fleet", server = %server.id(), error = %e, "Shutdown failed");
            }
        }
    }
}
