//! Opaque SFU parameter blobs.
//!
//! The orchestration layer never interprets ICE, DTLS or RTP parameters; it
//! only carries them between the SFU and the client. They are kept as raw
//! JSON values so that no particular SFU wire format leaks into the records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client RTP capabilities supplied when requesting transports.
pub type RtpCapabilities = serde_json::Value;

/// RTP parameters of a produced or consumed track.
pub type RtpParameters = serde_json::Value;

/// DTLS parameters (server-issued or client-supplied).
pub type DtlsParameters = serde_json::Value;

/// ICE parameters issued by the SFU for a transport.
pub type IceParameters = serde_json::Value;

/// ICE candidates issued by the SFU for a transport.
pub type IceCandidates = serde_json::Value;

/// Direction of a transport relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client to SFU (carries producers).
    Send,
    /// SFU to client (carries consumers).
    Recv,
}

impl TransportDirection {
    /// Both directions, send first.
    pub const ALL: [TransportDirection; 2] = [TransportDirection::Send, TransportDirection::Recv];

    /// Label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a published track. Calls are audio-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
}

impl MediaKind {
    /// Label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TransportDirection::Recv).unwrap(),
            "\"recv\""
        );
        assert_eq!(TransportDirection::Send.to_string(), "send");
    }

    #[test]
    fn test_kind_label() {
        assert_eq!(MediaKind::Audio.as_str(), "audio");
    }
}
