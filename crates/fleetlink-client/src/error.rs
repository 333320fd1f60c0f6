//! Endpoint error types.

use fleetlink_core::TransportError;
use fleetlink_crypto::CryptoError;
use fleetlink_proto::ProtocolError;
use fleetlink_queue::QueueError;
use thiserror::Error;

/// Errors surfaced by the endpoint runtime.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Server exchange failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Session protocol failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Local buffer failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Message encoding failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Blocking queue work panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(String),

    /// Key file or other local I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Returns true if the error only means the endpoint is shutting down.
    ///
    /// Pumps stop quietly on these instead of logging a failure.
    pub fn is_shutdown(&self) -> bool {
        match self {
            Self::Transport(err) => matches!(err, TransportError::Cancelled),
            Self::Queue(err) => err.is_closed(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_and_closed_queue_mean_shutdown() {
        assert!(ClientError::Transport(TransportError::Cancelled).is_shutdown());
        assert!(ClientError::Queue(QueueError::Closed).is_shutdown());
        assert!(!ClientError::Transport(TransportError::EnrolmentRequired).is_shutdown());
        assert!(!ClientError::Config("x".to_string()).is_shutdown());
    }
}
