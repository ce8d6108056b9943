//! `CallSession` - the participant's call state machine.
//!
//! ```text
//! not-in-call -> requesting-media -> media-error
//!                                 -> in-call -> not-in-call   (leave)
//!                                            -> failed        (connection failed)
//! any state -> not-in-call                                    (identity changed)
//! ```
//!
//! The session owns the capture stream, the audio context and the
//! `CallConnection`. It is busy while requesting media or in a call.

use crate::channel::CallChannel;
use crate::connection::{CallConnection, ConnectionStatus};
use crate::errors::ClientError;
use crate::media::{AudioContext, CaptureStream, MediaCapture, MediaDevice};
use call_protocol::{DesiredPeerState, JoinRequest};
use common::types::{CallId, HuntId, TabId};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Which call this tab is looking at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallIdentity {
    pub hunt: HuntId,
    pub call: CallId,
    pub tab: TabId,
}

/// Everything held while in a call.
pub struct ActiveCall {
    pub stream: CaptureStream,
    pub audio_context: AudioContext,
    pub connection: CallConnection,
}

pub enum CallState {
    NotInCall,
    RequestingMedia,
    MediaError { reason: String },
    InCall(ActiveCall),
    /// Negotiation or authorization failed after media was acquired.
    Failed { reason: String },
}

impl CallState {
    #[must_use]
    pub fn phase(&self) -> CallPhase {
        match self {
            CallState::NotInCall => CallPhase::NotInCall,
            CallState::RequestingMedia => CallPhase::RequestingMedia,
            CallState::MediaError { reason } => CallPhase::MediaError {
                reason: reason.clone(),
            },
            CallState::InCall(_) => CallPhase::InCall,
            CallState::Failed { reason } => CallPhase::Failed {
                reason: reason.clone(),
            },
        }
    }
}

/// Observable discriminant of [`CallState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPhase {
    NotInCall,
    RequestingMedia,
    MediaError { reason: String },
    InCall,
    Failed { reason: String },
}

impl CallPhase {
    /// Whether deferred maintenance should be held back.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, CallPhase::RequestingMedia | CallPhase::InCall)
    }
}

pub struct CallSession {
    capture: Arc<dyn MediaCapture>,
    device: Arc<dyn MediaDevice>,
    channel: Arc<dyn CallChannel>,
    identity: Option<CallIdentity>,
    state: CallState,
    phase: watch::Sender<CallPhase>,
    busy: watch::Sender<bool>,
}

impl CallSession {
    #[must_use]
    pub fn new(
        capture: Arc<dyn MediaCapture>,
        device: Arc<dyn MediaDevice>,
        channel: Arc<dyn CallChannel>,
    ) -> Self {
        let (phase, _) = watch::channel(CallPhase::NotInCall);
        let (busy, _) = watch::channel(false);
        Self {
            capture,
            device,
            channel,
            identity: None,
            state: CallState::NotInCall,
            phase,
            busy,
        }
    }

    #[must_use]
    pub fn identity(&self) -> Option<&CallIdentity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> &CallState {
        &self.state
    }

    #[must_use]
    pub fn phase(&self) -> CallPhase {
        self.state.phase()
    }

    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<CallPhase> {
        self.phase.subscribe()
    }

    /// True while requesting media or in a call.
    #[must_use]
    pub fn busy(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }

    /// The active connection, if in a call.
    #[must_use]
    pub fn connection(&self) -> Option<&CallConnection> {
        match &self.state {
            CallState::InCall(active) => Some(&active.connection),
            _ => None,
        }
    }

    fn transition(&mut self, state: CallState) {
        self.state = state;
        let phase = self.state.phase();
        self.busy.send_replace(phase.is_busy());
        self.phase.send_replace(phase);
    }

    /// Point the session at another call (or none). A change of identity
    /// leaves the current call and resets to not-in-call.
    pub async fn set_identity(&mut self, identity: Option<CallIdentity>) {
        if self.identity == identity {
            return;
        }
        if let Err(e) = self.leave().await {
            warn!(target: "client.session", error = %e, "Leave on identity change failed");
        }
        self.identity = identity;
        self.transition(CallState::NotInCall);
    }

    /// Acquire the microphone and join the current call. `preferred` is sent
    /// as the initial mute/deafen state; otherwise the server decides.
    ///
    /// # Errors
    ///
    /// - `InvalidState` without an identity, or when already in a call
    /// - `Capture` when the microphone is unavailable; the session is left in
    ///   `media-error`
    #[instrument(skip_all, name = "client.session.join")]
    pub async fn join(&mut self, preferred: Option<DesiredPeerState>) -> Result<(), ClientError> {
        let Some(identity) = self.identity.clone() else {
            return Err(ClientError::InvalidState("no call selected".to_string()));
        };
        if matches!(
            self.state,
            CallState::RequestingMedia | CallState::InCall(_)
        ) {
            return Err(ClientError::InvalidState("already in a call".to_string()));
        }

        self.transition(CallState::RequestingMedia);
        let stream = match self.capture.acquire_audio().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.media_error(e)),
        };
        let audio_context = match self.capture.create_audio_context().await {
            Ok(context) => context,
            Err(e) => {
                stream.stop();
                return Err(self.media_error(e));
            }
        };

        let mut request = JoinRequest::new(identity.hunt, identity.call, identity.tab);
        request.desired = preferred;
        let connection = CallConnection::spawn(
            Arc::clone(&self.channel),
            Arc::clone(&self.device),
            request,
            stream.tracks(),
        );
        info!(target: "client.session", call = %self.identity.as_ref().map_or("", |i| i.call.as_str()), "In call");
        self.transition(CallState::InCall(ActiveCall {
            stream,
            audio_context,
            connection,
        }));
        Ok(())
    }

    fn media_error(&mut self, error: ClientError) -> ClientError {
        warn!(target: "client.session", error = %error, "Media unavailable");
        self.transition(CallState::MediaError {
            reason: error.to_string(),
        });
        error
    }

    /// Leave the call and release the microphone.
    ///
    /// # Errors
    ///
    /// Returns the server's error from leaving; the session still ends up
    /// not-in-call.
    pub async fn leave(&mut self) -> Result<(), ClientError> {
        let previous = std::mem::replace(&mut self.state, CallState::NotInCall);
        let result = match previous {
            CallState::InCall(active) => {
                active.stream.stop();
                info!(target: "client.session", "Leaving call");
                active.connection.leave().await
            }
            _ => Ok(()),
        };
        self.transition(CallState::NotInCall);
        result
    }

    /// Fold the connection's status into the session. A failed connection
    /// moves the session to `failed`; a closed one to not-in-call.
    pub async fn refresh(&mut self) {
        let status = match &self.state {
            CallState::InCall(active) => active.connection.status(),
            _ => return,
        };
        let next = match status {
            ConnectionStatus::Failed(reason) => CallState::Failed { reason },
            ConnectionStatus::Closed => CallState::NotInCall,
            ConnectionStatus::Joining | ConnectionStatus::Connected => return,
        };
        if let CallState::InCall(active) = std::mem::replace(&mut self.state, CallState::NotInCall)
        {
            active.stream.stop();
            if let Err(e) = active.connection.leave().await {
                warn!(target: "client.session", error = %e, "Connection ended with error");
            }
        }
        self.transition(next);
    }

    /// # Errors
    ///
    /// `InvalidState` when not in a call; `RemoteMuteNotDismissed` when
    /// unmuting before the notice is dismissed.
    pub async fn set_muted(&self, muted: bool) -> Result<(), ClientError> {
        self.active_connection()?.set_muted(muted).await
    }

    /// # Errors
    ///
    /// `InvalidState` when not in a call.
    pub async fn set_deafened(&self, deafened: bool) -> Result<(), ClientError> {
        self.active_connection()?.set_deafened(deafened).await
    }

    /// # Errors
    ///
    /// `InvalidState` when not in a call.
    pub async fn dismiss_remote_mute(&self) -> Result<(), ClientError> {
        self.active_connection()?.dismiss_remote_mute().await
    }

    fn active_connection(&self) -> Result<&CallConnection, ClientError> {
        self.connection()
            .ok_or_else(|| ClientError::InvalidState("not in a call".to_string()))
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // The connection handle leaves on drop; the microphone is ours.
        if let CallState::InCall(active) = &self.state {
            active.stream.stop();
        }
    }
}
