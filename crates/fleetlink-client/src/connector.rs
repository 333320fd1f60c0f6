//! Raw server I/O contract.
//!
//! A [`Connector`] moves opaque envelope bytes to and from one server URL. It
//! knows nothing about rotation, backoff or sessions; [`crate::Transport`]
//! layers those on top. Production uses [`crate::HttpConnector`]; tests use
//! the simulated server from the harness crate.

use std::future::Future;

use bytes::Bytes;
use fleetlink_core::TransportError;

/// Server endpoint an exchange is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    /// Uploads from the sender
    Control,
    /// Polls from the receiver
    Reader,
}

impl Handler {
    /// URL path segment.
    pub fn path(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Reader => "reader",
        }
    }
}

/// Successful answer to a request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Server accepted the envelope; body is a reply envelope (may be empty)
    Delivered(Bytes),
    /// Server asked us to use another base URL
    Redirect(String),
}

/// Inbound traffic on a duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplexEvent {
    /// Server liveness ping
    Ping,
    /// Reply envelope (may be empty)
    Envelope(Bytes),
    /// Server closed the channel
    Closed,
}

/// Persistent bidirectional channel to one server.
///
/// `recv` must be cancel safe: dropping its future loses no event. Channels
/// are `Sync` so a transport holding one can be shared across an await.
pub trait DuplexChannel: Send + Sync {
    /// Send an envelope.
    fn send(&mut self, envelope: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound event.
    fn recv(&mut self) -> impl Future<Output = Result<DuplexEvent, TransportError>> + Send;
}

/// Connector that never offers a duplex channel.
#[derive(Debug)]
pub enum NoDuplex {}

impl DuplexChannel for NoDuplex {
    async fn send(&mut self, _envelope: Bytes) -> Result<(), TransportError> {
        match *self {}
    }

    async fn recv(&mut self) -> Result<DuplexEvent, TransportError> {
        match *self {}
    }
}

/// Envelope I/O against server base URLs.
pub trait Connector: Send + Sync + 'static {
    /// Duplex channel type.
    type Duplex: DuplexChannel;

    /// Fetch the PEM-encoded server key from `<base_url>/server.pem`.
    fn server_key(&self, base_url: &str)
    -> impl Future<Output = Result<String, TransportError>> + Send;

    /// POST an envelope to `<base_url>/<handler>`.
    ///
    /// # Errors
    ///
    /// - `TransportError::EnrolmentRequired` if the server does not know us
    /// - `TransportError::Unreachable` / `TransportError::Status` otherwise
    fn post(
        &self,
        base_url: &str,
        handler: Handler,
        envelope: Bytes,
        urgent: bool,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;

    /// Open a duplex channel to `<base_url>/<handler>`.
    fn open_duplex(
        &self,
        base_url: &str,
        handler: Handler,
    ) -> impl Future<Output = Result<Self::Duplex, TransportError>> + Send;
}
