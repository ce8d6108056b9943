//! Join and command payloads sent from clients.

use crate::state::PeerState;
use common::types::{CallId, HuntId, TabId};
use serde::{Deserialize, Serialize};

/// The two independent mute/deafen bits a client wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DesiredPeerState {
    /// Explicit mute bit.
    pub muted: bool,
    /// Deafen bit.
    pub deafened: bool,
}

impl DesiredPeerState {
    /// Construct from the two bits.
    #[must_use]
    pub fn new(muted: bool, deafened: bool) -> Self {
        Self { muted, deafened }
    }

    /// Effective state of these bits.
    #[must_use]
    pub fn effective(self) -> PeerState {
        PeerState::effective(self.muted, self.deafened)
    }
}

/// Request to attach one client session to a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub hunt: HuntId,
    pub call: CallId,
    pub tab: TabId,
    /// Client-supplied state. When present it wins over any remembered state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<DesiredPeerState>,
}

impl JoinRequest {
    /// Build a join request without a desired state.
    #[must_use]
    pub fn new(hunt: HuntId, call: CallId, tab: TabId) -> Self {
        Self {
            hunt,
            call,
            tab,
            desired: None,
        }
    }

    /// Attach a client-supplied desired state.
    #[must_use]
    pub fn with_desired(mut self, desired: DesiredPeerState) -> Self {
        self.desired = Some(desired);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_effective() {
        assert_eq!(DesiredPeerState::new(true, true).effective(), PeerState::Deafened);
        assert_eq!(DesiredPeerState::default().effective(), PeerState::Active);
    }

    #[test]
    fn test_join_request_omits_missing_desired() {
        let req = JoinRequest::new("h".into(), "c".into(), "t".into());
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("desired").is_none());

        let req = req.with_desired(DesiredPeerState::new(true, false));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["desired"]["muted"], serde_json::json!(true));
    }
}
