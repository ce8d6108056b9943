//! Call Controller error types.
//!
//! Errors map to numeric codes for client responses. Internal details are
//! logged server-side but not exposed to clients.

use crate::sfu::SfuError;
use crate::store::StoreError;
use thiserror::Error;

/// Call Controller error type.
///
/// Maps to client error codes:
/// - `NotAMember`, `FeatureDisabled`: `UNAUTHORIZED` (2)
/// - `PermissionDenied`, `RemoteMuted`: `FORBIDDEN` (3)
/// - `NotFound`: `NOT_FOUND` (4)
/// - `Conflict`: `CONFLICT` (5)
/// - Store, Sfu, Config, `LockLost`, Internal: `INTERNAL_ERROR` (6)
#[derive(Debug, Error)]
pub enum CallError {
    /// Document store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// SFU operation failed.
    #[error("SFU error: {0}")]
    Sfu(#[from] SfuError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Referenced document does not exist (or was soft-deleted).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Acting user is not a member of the hunt.
    #[error("Not a member of hunt {0}")]
    NotAMember(String),

    /// Calls are disabled on this deployment.
    #[error("Calls are disabled")]
    FeatureDisabled,

    /// Acting user may not act on this peer.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Unmute attempted while a remote mute is outstanding.
    #[error("Peer is remote muted by {0}")]
    RemoteMuted(String),

    /// Request conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A held lock was reclaimed by another process before release.
    #[error("Lock lost: {0}")]
    LockLost(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error category, used by callers to decide between retry, restart and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// SFU call failed or parameters were rejected. Restart the join flow.
    Negotiation,
    /// Not a member, feature disabled, not your peer. Do not retry.
    Authorization,
    /// Duplicate key or lost lease under concurrency. Retry or ignore.
    RaceLoss,
    /// Everything else.
    Internal,
}

impl CallError {
    /// Returns the client error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            CallError::NotAMember(_) | CallError::FeatureDisabled => 2, // UNAUTHORIZED
            CallError::PermissionDenied(_) | CallError::RemoteMuted(_) => 3, // FORBIDDEN
            CallError::NotFound(_) | CallError::Store(StoreError::NotFound { .. }) => 4, // NOT_FOUND
            CallError::Conflict(_) | CallError::Store(StoreError::DuplicateKey { .. }) => 5, // CONFLICT
            CallError::Store(_)
            | CallError::Sfu(_)
            | CallError::Config(_)
            | CallError::LockLost(_)
            | CallError::Internal(_) => 6, // INTERNAL_ERROR
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CallError::Store(StoreError::NotFound { .. }) | CallError::NotFound(_) => {
                "Not found".to_string()
            }
            CallError::Store(StoreError::DuplicateKey { .. }) => "Already exists".to_string(),
            CallError::Store(_)
            | CallError::Config(_)
            | CallError::LockLost(_)
            | CallError::Internal(_) => "An internal error occurred".to_string(),
            CallError::Sfu(_) => "Media server error".to_string(),
            CallError::NotAMember(_) => "Not a member of this hunt".to_string(),
            CallError::FeatureDisabled => "Calls are disabled".to_string(),
            CallError::PermissionDenied(_) => "Permission denied".to_string(),
            CallError::RemoteMuted(_) => {
                "You were muted by another participant; dismiss the notice first".to_string()
            }
            CallError::Conflict(msg) => msg.clone(),
        }
    }

    /// Returns the error class.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            CallError::Sfu(_) => ErrorClass::Negotiation,
            CallError::NotAMember(_)
            | CallError::FeatureDisabled
            | CallError::PermissionDenied(_)
            | CallError::RemoteMuted(_) => ErrorClass::Authorization,
            CallError::Store(StoreError::DuplicateKey { .. } | StoreError::Stale { .. })
            | CallError::LockLost(_) => ErrorClass::RaceLoss,
            CallError::Store(_)
            | CallError::Config(_)
            | CallError::NotFound(_)
            | CallError::Conflict(_)
            | CallError::Internal(_) => ErrorClass::Internal,
        }
    }
}
