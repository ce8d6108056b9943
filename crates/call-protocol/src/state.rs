//! Mute/deafen state.
//!
//! Deafened implies effectively muted, but the explicit-mute bit is tracked
//! independently so that undeafening restores whatever the participant had
//! chosen before deafening.

use serde::{Deserialize, Serialize};

/// Externally visible state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Active,
    Muted,
    Deafened,
}

impl PeerState {
    /// Combine the two independent bits into the effective state.
    #[must_use]
    pub fn effective(muted: bool, deafened: bool) -> Self {
        if deafened {
            PeerState::Deafened
        } else if muted {
            PeerState::Muted
        } else {
            PeerState::Active
        }
    }

    /// Whether no audio leaves the peer in this state.
    #[must_use]
    pub fn is_effectively_muted(self) -> bool {
        !matches!(self, PeerState::Active)
    }

    /// Label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Active => "active",
            PeerState::Muted => "muted",
            PeerState::Deafened => "deafened",
        }
    }
}
