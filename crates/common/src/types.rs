//! Opaque identifier types for the call subsystem.
//!
//! Every identifier is an opaque string. The newtypes exist so that a call id
//! can never be passed where a hunt id is expected; they carry no structure.

use crate::error::CommonError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Parse an identifier, rejecting empty or whitespace-bearing values.
            ///
            /// # Errors
            ///
            /// Returns `CommonError::InvalidId` if the value is empty or contains whitespace.
            pub fn parse(value: impl Into<String>) -> Result<Self, CommonError> {
                let value = value.into();
                if value.is_empty() || value.chars().any(char::is_whitespace) {
                    return Err(CommonError::InvalidId {
                        kind: $kind,
                        value,
                    });
                }
                Ok(Self(value))
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a puzzle hunt (the authorization scope).
    HuntId,
    "hunt"
);

string_id!(
    /// Identifier of a call. One live Room exists per call.
    CallId,
    "call"
);

string_id!(
    /// Identifier of one client session (a browser tab). Never reused.
    TabId,
    "tab"
);

string_id!(
    /// Document id of a Peer record.
    PeerId,
    "peer"
);

string_id!(
    /// Identifier of an acting user.
    UserId,
    "user"
);

string_id!(
    /// Identity of one application server process.
    ServerId,
    "server"
);

impl ServerId {
    /// Generate a fresh server identity with the given prefix.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4()))
    }
}

impl TabId {
    /// Generate a fresh tab identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Generate a new opaque document id.
#[must_use]
pub fn new_document_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        assert!(CallId::parse("").is_err());
        assert!(CallId::parse("two words").is_err());
        assert_eq!(CallId::parse("puzzle-17").unwrap().as_str(), "puzzle-17");
    }

    #[test]
    fn test_invalid_id_reports_kind() {
        let err = HuntId::parse(" ").unwrap_err();
        assert_eq!(
            err,
            CommonError::InvalidId {
                kind: "hunt",
                value: " ".to_string()
            }
        );
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = PeerId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: PeerId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ServerId::generate("cc"), ServerId::generate("cc"));
        assert!(ServerId::generate("cc").as_str().starts_with("cc-"));
        assert_ne!(new_document_id(), new_document_id());
    }
}
