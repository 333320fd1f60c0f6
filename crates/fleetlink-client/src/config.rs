//! Endpoint configuration.

use std::{path::PathBuf, time::Duration};

use fleetlink_core::{ExchangeMode, LivenessConfig, RotationConfig};
use fleetlink_crypto::CryptoConfig;

/// Default upload budget per exchange.
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 5 * 1024 * 1024;

/// Local buffer sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBufferConfig {
    /// Capacity of the in-memory buffer, used when no file buffer is
    /// configured or the file cannot be created
    pub memory_size: u64,
    /// Capacity of the file buffer; 0 disables it
    pub disk_size: u64,
    /// File buffer location
    pub filename: Option<PathBuf>,
    /// Keep the file across restarts so unsent records are replayed
    pub persistent: bool,
}

impl Default for LocalBufferConfig {
    fn default() -> Self {
        Self {
            memory_size: 50 * 1024 * 1024,
            disk_size: 1024 * 1024 * 1024,
            filename: None,
            persistent: true,
        }
    }
}

/// Server exchange tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Server base URLs, tried in rotation
    pub server_urls: Vec<String>,
    /// Required identity of the server key, if pinned
    pub pinned_server_name: Option<String>,
    /// Rotation and backoff
    pub rotation: RotationConfig,
    /// Preferred exchange mode
    pub exchange_mode: ExchangeMode,
    /// Duplex ping deadline
    pub liveness: LivenessConfig,
    /// Consecutive duplex failures before falling back to request/response
    pub duplex_fallback_after: u32,
    /// How long to stay on request/response after falling back
    pub duplex_retry_after: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_urls: Vec::new(),
            pinned_server_name: None,
            rotation: RotationConfig::default(),
            exchange_mode: ExchangeMode::RequestResponse,
            liveness: LivenessConfig::default(),
            duplex_fallback_after: 3,
            duplex_retry_after: Duration::from_secs(600),
        }
    }
}

/// Complete endpoint configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upload budget per exchange, in compressed bytes
    pub max_upload_size: u64,
    /// Shortest wait between drains and between polls after activity
    pub min_poll: Duration,
    /// Poll interval when the server has nothing for us
    pub max_poll: Duration,
    /// Random addition to `max_poll`
    pub max_poll_jitter: Duration,
    /// Compress upload chunks
    pub compression: bool,
    /// Minimum spacing between enrolment attempts
    pub enrolment_interval: Duration,
    /// Delay between receiving a kill request and exiting
    pub kill_grace: Duration,
    /// Local buffer
    pub buffer: LocalBufferConfig,
    /// Server exchange
    pub transport: TransportConfig,
    /// Session protocol
    pub crypto: CryptoConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            min_poll: Duration::from_secs(1),
            max_poll: Duration::from_secs(60),
            max_poll_jitter: Duration::from_secs(30),
            compression: true,
            enrolment_interval: Duration::from_secs(60),
            kill_grace: Duration::from_secs(10),
            buffer: LocalBufferConfig::default(),
            transport: TransportConfig::default(),
            crypto: CryptoConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Capacity of the urgent lane.
    pub fn urgent_capacity(&self) -> u64 {
        self.max_upload_size * 2
    }
}
