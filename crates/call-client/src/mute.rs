//! Reconciliation of local mute/deafen intent with the server's Peer.
//!
//! The reconciler is pure: it is fed the observed Peer and the user's
//! actions, and answers with the commands to send. Both bits are compared,
//! never only the effective state, so an explicit mute hidden under deafen
//! survives round trips.
//!
//! While a remote mute is outstanding on the server nothing is pushed; the
//! only permitted command is the acknowledgement, sent once per episode.
//! Local changes made meanwhile are deferred and pushed once it clears.

use crate::errors::ClientError;
use call_protocol::{DesiredPeerState, Peer, PeerState};
use common::types::UserId;

/// Command the reconciler wants sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteAction {
    AckRemoteMute,
    Push(DesiredPeerState),
}

#[derive(Debug, Clone, Default)]
pub struct MuteReconciler {
    desired: DesiredPeerState,
    /// Whether the user changed anything since joining. Untouched state
    /// follows the server (crowd default, resumed state).
    touched: bool,
    server: Option<DesiredPeerState>,
    server_remote_muted_by: Option<UserId>,
    /// Ack already sent for the current remote-mute episode.
    acked: bool,
    notice: Option<UserId>,
    in_flight: Option<DesiredPeerState>,
}

impl MuteReconciler {
    /// Start with the state the client asked for at join, if any.
    #[must_use]
    pub fn new(preferred: Option<DesiredPeerState>) -> Self {
        Self {
            desired: preferred.unwrap_or_default(),
            touched: preferred.is_some(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn desired(&self) -> DesiredPeerState {
        self.desired
    }

    /// Local effective state.
    #[must_use]
    pub fn effective(&self) -> PeerState {
        self.desired.effective()
    }

    /// Who remote-muted us, until the user dismisses the notice.
    #[must_use]
    pub fn notice(&self) -> Option<&UserId> {
        self.notice.as_ref()
    }

    /// Fold in the server's view of our Peer.
    pub fn observe(&mut self, peer: &Peer) -> Vec<MuteAction> {
        let server = peer.bits();
        self.server = Some(server);
        self.server_remote_muted_by.clone_from(&peer.remote_muted_by);
        if self.in_flight == Some(server) {
            self.in_flight = None;
        }

        let mut actions = Vec::new();
        match &peer.remote_muted_by {
            Some(by) => {
                if !self.acked {
                    self.acked = true;
                    self.notice = Some(by.clone());
                    self.desired.muted = true;
                    actions.push(MuteAction::AckRemoteMute);
                }
                // No pushes until the server clears the remote mute.
                return actions;
            }
            None => self.acked = false,
        }

        if !self.touched {
            self.desired = server;
        }
        actions.extend(self.pending_push());
        actions
    }

    /// User toggles the explicit-mute bit.
    ///
    /// # Errors
    ///
    /// `RemoteMuteNotDismissed` when unmuting while the remote-mute notice
    /// is still shown.
    pub fn set_muted(&mut self, muted: bool) -> Result<Vec<MuteAction>, ClientError> {
        if !muted && self.notice.is_some() {
            return Err(ClientError::RemoteMuteNotDismissed);
        }
        self.touched = true;
        self.desired.muted = muted;
        Ok(self.pending_push().into_iter().collect())
    }

    /// User toggles the deafen bit. The explicit-mute bit is kept as is.
    pub fn set_deafened(&mut self, deafened: bool) -> Vec<MuteAction> {
        self.touched = true;
        self.desired.deafened = deafened;
        self.pending_push().into_iter().collect()
    }

    /// User dismisses the remote-mute notice. Does not unmute.
    pub fn dismiss_notice(&mut self) {
        self.notice = None;
    }

    /// A push failed; allow it to be sent again on the next change.
    pub fn push_failed(&mut self) {
        self.in_flight = None;
    }

    fn pending_push(&mut self) -> Option<MuteAction> {
        let server = self.server?;
        if self.server_remote_muted_by.is_some()
            || server == self.desired
            || self.in_flight == Some(self.desired)
        {
            return None;
        }
        self.in_flight = Some(self.desired);
        Some(MuteAction::Push(self.desired))
    }
}
