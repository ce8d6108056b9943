//! Call Client error types.

use thiserror::Error;

/// Errors surfaced to the participant.
///
/// - `Capture`: microphone unavailable or denied. Retry by joining again.
/// - `Negotiation`: an SFU step failed. The join flow must restart.
/// - `Authorization`: not a member, calls disabled, not your peer. Final.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Microphone unavailable: {0}")]
    Capture(String),

    #[error("Call negotiation failed: {0}")]
    Negotiation(String),

    #[error("Not allowed: {0}")]
    Authorization(String),

    /// The reactive channel failed or closed.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Unmute attempted before the remote-mute notice was dismissed.
    #[error("Dismiss the remote mute notice before unmuting")]
    RemoteMuteNotDismissed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The server refused a command for reasons other than authorization.
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl ClientError {
    /// Whether joining again may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Capture(_) | ClientError::Negotiation(_) | ClientError::Channel(_)
        )
    }
}
