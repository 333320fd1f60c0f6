//! In-process server for endpoint tests.
//!
//! [`SimServer`] plays the server side of the session protocol directly
//! behind the [`Connector`] trait: no sockets, no HTTP. It owns a real
//! [`CryptoManager`], so every envelope an endpoint sends is decrypted and
//! authenticated exactly as a production server would.
//!
//! Behaviour per upload:
//!
//! - unknown sender carrying its own enrolment message: key registered,
//!   empty reply
//! - unknown sender otherwise: [`TransportError::EnrolmentRequired`]
//! - known sender on `control`: messages recorded
//! - known sender on `reader`: queued requests for that sender returned
//!
//! Knobs simulate outages, redirects and half-open duplex channels.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use fleetlink_client::{Connector, DuplexChannel, DuplexEvent, Handler, Response};
use fleetlink_core::TransportError;
use fleetlink_crypto::{CryptoConfig, CryptoManager, InMemoryResolver, KeyMaterial};
use fleetlink_proto::{Compression, Message, MessageKind, MessageList, MessagePayload};

use crate::SimEnv;

/// Interval between pings on healthy simulated duplex channels.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct State {
    offline: bool,
    redirect: Option<String>,
    silent_duplex: bool,
    ping_interval: Option<Duration>,
    received: Vec<Message>,
    pending: HashMap<String, VecDeque<Message>>,
    post_urls: Vec<String>,
    urgent_posts: usize,
    posts: usize,
    duplex_opens: usize,
    key_fetches: usize,
    enrolled: Vec<String>,
}

struct Shared {
    crypto: CryptoManager<SimEnv>,
    pem: String,
    state: Mutex<State>,
}

/// Simulated server. Clones share state.
#[derive(Clone)]
pub struct SimServer {
    shared: Arc<Shared>,
}

impl SimServer {
    /// Server using `key`, trusting nobody until they enrol.
    #[allow(clippy::expect_used)]
    pub fn new(env: SimEnv, key: KeyMaterial) -> Self {
        let pem = key.public_key_pem().expect("invariant: fixture keys encode as PEM");
        let crypto =
            CryptoManager::new(env, key, Arc::new(InMemoryResolver::new()), CryptoConfig::default());
        Self { shared: Arc::new(Shared { crypto, pem, state: Mutex::new(State::default()) }) }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Server identity.
    pub fn identity(&self) -> &str {
        self.shared.crypto.identity()
    }

    /// Server-side crypto manager.
    pub fn crypto(&self) -> &CryptoManager<SimEnv> {
        &self.shared.crypto
    }

    /// Trust `endpoint` without an enrolment round trip.
    #[allow(clippy::expect_used)]
    pub fn trust(&self, endpoint: &KeyMaterial) {
        let pem = endpoint.public_key_pem().expect("invariant: fixture keys encode as PEM");
        self.shared
            .crypto
            .register_peer_key(endpoint.identity(), &pem)
            .expect("invariant: a key always derives its own identity");
    }

    /// Refuse every request while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Answer the next upload with a redirect to `url`.
    pub fn redirect_once(&self, url: &str) {
        self.state().redirect = Some(url.to_string());
    }

    /// Duplex channels accept sends but never answer or ping.
    pub fn set_silent_duplex(&self, silent: bool) {
        self.state().silent_duplex = silent;
    }

    /// Ping interval on healthy duplex channels.
    pub fn set_ping_interval(&self, interval: Duration) {
        self.state().ping_interval = Some(interval);
    }

    /// Queue `request` for the endpoint `destination`.
    pub fn push_request(&self, destination: &str, request: Message) {
        self.state().pending.entry(destination.to_string()).or_default().push_back(request);
    }

    /// Messages received from authenticated endpoints, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        self.state().received.clone()
    }

    /// Identities enrolled through the protocol.
    pub fn enrolled(&self) -> Vec<String> {
        self.state().enrolled.clone()
    }

    /// Uploads accepted over request/response.
    pub fn posts(&self) -> usize {
        self.state().posts
    }

    /// Base URL of every POST that reached the server, redirected ones included.
    pub fn post_urls(&self) -> Vec<String> {
        self.state().post_urls.clone()
    }

    /// Uploads flagged urgent.
    pub fn urgent_posts(&self) -> usize {
        self.state().urgent_posts
    }

    /// Duplex channels opened.
    pub fn duplex_opens(&self) -> usize {
        self.state().duplex_opens
    }

    /// Fetches of `server.pem`.
    pub fn key_fetches(&self) -> usize {
        self.state().key_fetches
    }

    fn check_online(&self, url: &str) -> Result<(), TransportError> {
        if self.state().offline {
            return Err(TransportError::Unreachable {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    /// Decrypt, authenticate and act on one envelope; returns the reply.
    async fn handle(&self, url: &str, handler: Handler, envelope: &[u8]) -> Result<Bytes, TransportError> {
        let bad_request = |reason: String| {
            tracing::debug!(%reason, "sim server rejected envelope");
            TransportError::Status { url: url.to_string(), status: 400 }
        };

        let mut info = self.shared.crypto.decrypt(envelope).await.map_err(|e| bad_request(e.to_string()))?;
        if info.is_empty() {
            return Ok(Bytes::new());
        }
        let messages = info.messages().map_err(|e| bad_request(e.to_string()))?;

        if !info.authenticated {
            self.enrol(&info.source, &messages)?;
            // The sender's key is known now, so the same envelope authenticates.
            info = self.shared.crypto.decrypt(envelope).await.map_err(|e| bad_request(e.to_string()))?;
            if !info.authenticated {
                return Err(TransportError::EnrolmentRequired);
            }
        }

        match handler {
            Handler::Control => {
                self.state()
                    .received
                    .extend(messages.into_iter().filter(|m| m.kind() != MessageKind::Enrolment));
                Ok(Bytes::new())
            },
            Handler::Reader => {
                let requests: Vec<Message> =
                    self.state().pending.remove(&info.source).map(Vec::from).unwrap_or_default();
                if requests.is_empty() {
                    return Ok(Bytes::new());
                }
                self.shared
                    .crypto
                    .encrypt_messages(&[MessageList { messages: requests }], Compression::Zlib, &info.source)
                    .map_err(|e| bad_request(e.to_string()))
            },
        }
    }

    fn enrol(&self, source: &str, messages: &[Message]) -> Result<(), TransportError> {
        let enrolment = messages.iter().find_map(|m| match &m.payload {
            MessagePayload::Enrolment { public_key_pem } if m.source == source => Some(public_key_pem),
            _ => None,
        });
        let Some(pem) = enrolment else {
            return Err(TransportError::EnrolmentRequired);
        };

        self.shared.crypto.register_peer_key(source, pem).map_err(|_| TransportError::EnrolmentRequired)?;
        self.state().enrolled.push(source.to_string());
        Ok(())
    }
}

impl Connector for SimServer {
    type Duplex = SimDuplex;

    async fn server_key(&self, base_url: &str) -> Result<String, TransportError> {
        self.check_online(base_url)?;
        self.state().key_fetches += 1;
        Ok(self.shared.pem.clone())
    }

    async fn post(
        &self,
        base_url: &str,
        handler: Handler,
        envelope: Bytes,
        urgent: bool,
    ) -> Result<Response, TransportError> {
        self.check_online(base_url)?;
        let redirect = {
            let mut state = self.state();
            state.post_urls.push(base_url.to_string());
            state.redirect.take()
        };
        if let Some(target) = redirect {
            return Ok(Response::Redirect(target));
        }

        let reply = self.handle(base_url, handler, &envelope).await?;
        let mut state = self.state();
        state.posts += 1;
        if urgent {
            state.urgent_posts += 1;
        }
        Ok(Response::Delivered(reply))
    }

    async fn open_duplex(&self, base_url: &str, handler: Handler) -> Result<SimDuplex, TransportError> {
        self.check_online(base_url)?;
        let mut state = self.state();
        state.duplex_opens += 1;
        Ok(SimDuplex {
            server: self.clone(),
            url: base_url.to_string(),
            handler,
            silent: state.silent_duplex,
            ping_interval: state.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            inbound: VecDeque::new(),
        })
    }
}

/// Duplex channel to a [`SimServer`].
pub struct SimDuplex {
    server: SimServer,
    url: String,
    handler: Handler,
    silent: bool,
    ping_interval: Duration,
    inbound: VecDeque<DuplexEvent>,
}

impl DuplexChannel for SimDuplex {
    async fn send(&mut self, envelope: Bytes) -> Result<(), TransportError> {
        if self.silent {
            return Ok(());
        }
        let reply = self.server.handle(&self.url, self.handler, &envelope).await?;
        self.inbound.push_back(DuplexEvent::Envelope(reply));
        Ok(())
    }

    async fn recv(&mut self) -> Result<DuplexEvent, TransportError> {
        if let Some(event) = self.inbound.pop_front() {
            return Ok(event);
        }
        if self.silent {
            return std::future::pending().await;
        }
        tokio::time::sleep(self.ping_interval).await;
        Ok(DuplexEvent::Ping)
    }
}
