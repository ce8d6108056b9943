//! Mute/deafen rules applied on the server.
//!
//! Initial state on join, first match wins:
//! 1. the state the client asked for;
//! 2. the bits of a still-live Peer for the same (hunt, call, tab), so a
//!    reconnect keeps its hidden explicit-mute bit under deafen;
//! 3. muted if admitting this peer reaches the crowd threshold, else active.

use crate::errors::CallError;
use call_protocol::{DesiredPeerState, Peer, PeerState};
use common::types::UserId;

/// Where an initial state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialStateSource {
    Client,
    Resumed,
    Crowd,
    Default,
}

impl InitialStateSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            InitialStateSource::Client => "client",
            InitialStateSource::Resumed => "resumed",
            InitialStateSource::Crowd => "crowd",
            InitialStateSource::Default => "default",
        }
    }
}

/// Decided initial state of a joining peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialState {
    pub bits: DesiredPeerState,
    /// Carried over from a resumed peer whose remote mute was never acknowledged.
    pub remote_muted_by: Option<UserId>,
    pub source: InitialStateSource,
}

impl InitialState {
    #[must_use]
    pub fn peer_state(&self) -> PeerState {
        self.bits.effective()
    }
}

/// Decide the initial state of a joining peer.
///
/// `existing_peers` counts the other live peers in the call, excluding any
/// prior peer for the same tab that is being replaced.
#[must_use]
pub fn initial_state(
    desired: Option<DesiredPeerState>,
    prior: Option<&Peer>,
    existing_peers: usize,
    crowd_threshold: usize,
) -> InitialState {
    let carried_remote_mute = prior.and_then(|p| p.remote_muted_by.clone());

    if let Some(bits) = desired {
        // A pending remote mute still forces the explicit-mute bit.
        let bits = if carried_remote_mute.is_some() {
            DesiredPeerState::new(true, bits.deafened)
        } else {
            bits
        };
        return InitialState {
            bits,
            remote_muted_by: carried_remote_mute,
            source: InitialStateSource::Client,
        };
    }

    if let Some(prior) = prior {
        return InitialState {
            bits: prior.bits(),
            remote_muted_by: carried_remote_mute,
            source: InitialStateSource::Resumed,
        };
    }

    if existing_peers + 1 >= crowd_threshold {
        InitialState {
            bits: DesiredPeerState::new(true, false),
            remote_muted_by: None,
            source: InitialStateSource::Crowd,
        }
    } else {
        InitialState {
            bits: DesiredPeerState::default(),
            remote_muted_by: None,
            source: InitialStateSource::Default,
        }
    }
}

/// Apply a peer's own state update.
///
/// # Errors
///
/// Returns `CallError::RemoteMuted` when the update would clear the
/// explicit-mute bit while a remote mute is outstanding.
pub fn apply_state_update(peer: &mut Peer, requested: DesiredPeerState) -> Result<(), CallError> {
    if let Some(by) = &peer.remote_muted_by {
        if !requested.muted {
            return Err(CallError::RemoteMuted(by.to_string()));
        }
    }
    peer.muted = requested.muted;
    peer.deafened = requested.deafened;
    Ok(())
}

/// Force-mute a peer on behalf of `actor`.
///
/// # Errors
///
/// Returns `CallError::PermissionDenied` when the actor targets their own
/// peer, and `CallError::Conflict` when the peer is already effectively muted.
pub fn apply_remote_mute(peer: &mut Peer, actor: &UserId) -> Result<(), CallError> {
    if peer.user() == actor {
        return Err(CallError::PermissionDenied(
            "cannot remote mute yourself".to_string(),
        ));
    }
    if peer.effective_state().is_effectively_muted() {
        return Err(CallError::Conflict("Peer is already muted".to_string()));
    }
    peer.muted = true;
    peer.remote_muted_by = Some(actor.clone());
    Ok(())
}

/// Acknowledge an outstanding remote mute. The explicit-mute bit stays set.
///
/// Returns `false` when there was nothing to acknowledge.
pub fn apply_remote_mute_ack(peer: &mut Peer) -> bool {
    if peer.remote_muted_by.take().is_some() {
        peer.muted = true;
        true
    } else {
        false
    }
}
