//! Common error types for the call subsystem.

use thiserror::Error;

/// Errors raised while constructing or validating shared values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// An identifier was empty or contained whitespace.
    #[error("Invalid {kind} identifier: {value:?}")]
    InvalidId {
        /// Identifier kind (e.g. "call", "hunt").
        kind: &'static str,
        /// Offending value.
        value: String,
    },

    /// Tracing could not be initialized.
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type alias using `CommonError`
pub type Result<T> = std::result::Result<T, CommonError>;
