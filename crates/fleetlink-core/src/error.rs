//! Transport error taxonomy.
//!
//! Transport errors never lose data: the caller keeps its lease and retries.
//! The split that matters is whether retrying the same exchange can succeed
//! ([`TransportError::is_transient`]) or whether the endpoint must change
//! something first (enrol, fetch a new server key, fix its configuration).

use std::time::Duration;

use thiserror::Error;

/// Errors produced while exchanging envelopes with a server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No server URLs configured
    #[error("no server URLs configured")]
    NoServers,

    /// Network-level failure talking to a URL
    #[error("failed to reach {url}: {reason}")]
    Unreachable {
        /// URL that failed
        url: String,
        /// Underlying failure
        reason: String,
    },

    /// Server answered with an unexpected status
    #[error("server {url} returned status {status}")]
    Status {
        /// URL that answered
        url: String,
        /// Status code
        status: u16,
    },

    /// Server does not know this endpoint and asked it to enrol
    #[error("server requested enrolment")]
    EnrolmentRequired,

    /// Server presented a key for an unexpected identity
    #[error("server identity mismatch: expected {expected}, got {actual}")]
    ServerIdentityMismatch {
        /// Pinned server identity
        expected: String,
        /// Identity derived from the presented key
        actual: String,
    },

    /// Full-duplex channel missed its ping deadline
    #[error("no ping from server for {silence:?}")]
    LivenessLost {
        /// Time since the last ping
        silence: Duration,
    },

    /// Envelope could not be sealed or opened
    #[error("envelope error: {0}")]
    Envelope(String),

    /// Shutdown was requested while the exchange was in flight
    #[error("exchange cancelled")]
    Cancelled,
}

impl TransportError {
    /// Returns true if retrying the same exchange later may succeed.
    ///
    /// Network failures, bad statuses and liveness loss are transient.
    /// Enrolment, identity mismatch and envelope errors need a change on this
    /// side first; cancellation is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Status { .. } | Self::LivenessLost { .. })
    }
}

impl From<fleetlink_proto::ProtocolError> for TransportError {
    fn from(err: fleetlink_proto::ProtocolError) -> Self {
        Self::Envelope(err.to_string())
    }
}
