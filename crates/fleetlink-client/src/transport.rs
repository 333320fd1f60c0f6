//! Server exchange with rotation, backoff and duplex liveness.
//!
//! [`Transport`] turns one upload into one round trip with whichever server
//! currently answers. Per attempt it:
//!
//! 1. fetches and installs the server key if it does not have one yet,
//!    enforcing the pinned server identity when configured
//! 2. seals the upload for the server identity
//! 3. exchanges it in the current [`ExchangeMode`]
//! 4. opens the reply envelope and returns the authenticated messages
//!
//! Failures are reported to [`ServerRotation`], which decides between
//! retrying the same URL and advancing to the next one. The wait it asks for
//! is served here, cancellably, before the error is returned: the caller
//! rolls back its lease and simply calls again.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use fleetlink_core::{
    Environment, ExchangeMode, Liveness, LivenessConfig, ModeSelector, ServerRotation, TransportError,
};
use fleetlink_crypto::{CryptoError, CryptoManager};
use fleetlink_proto::{Compression, Message};

use crate::{
    config::TransportConfig,
    connector::{Connector, DuplexChannel, DuplexEvent, Handler, Response},
    shutdown::Shutdown,
};

/// Redirects followed within one exchange before the server counts as failing.
const MAX_REDIRECTS: u32 = 3;

/// One batch to deliver.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    /// Separately compressed record chunks
    pub chunks: Vec<Bytes>,
    /// Compression applied to every chunk
    pub compression: Compression,
    /// Ask the server to process this batch ahead of others
    pub urgent: bool,
}

struct DuplexState<I, D>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    channel: D,
    liveness: Liveness<I>,
    url: String,
}

/// Exchanges envelopes with one handler across the configured servers.
pub struct Transport<E: Environment, C: Connector> {
    env: E,
    connector: Arc<C>,
    crypto: Arc<CryptoManager<E>>,
    handler: Handler,
    pinned_server_name: Option<String>,
    liveness: LivenessConfig,
    cycle_jitter: Duration,
    rotation: ServerRotation,
    mode: ModeSelector<E::Instant>,
    server_identity: Option<String>,
    duplex: Option<DuplexState<E::Instant, C::Duplex>>,
}

impl<E: Environment, C: Connector> Transport<E, C> {
    /// Transport for `handler`, starting at a random configured URL.
    ///
    /// # Errors
    ///
    /// - `TransportError::NoServers` if no URLs are configured
    pub fn new(
        env: E,
        connector: Arc<C>,
        crypto: Arc<CryptoManager<E>>,
        handler: Handler,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let start = env.random_u64() as usize;
        let rotation = ServerRotation::new(config.server_urls.clone(), config.rotation.clone(), start)?;
        Ok(Self {
            mode: ModeSelector::new(
                config.exchange_mode,
                config.duplex_fallback_after,
                config.duplex_retry_after,
            ),
            env,
            connector,
            crypto,
            handler,
            pinned_server_name: config.pinned_server_name.clone(),
            liveness: config.liveness,
            cycle_jitter: config.rotation.cycle_jitter,
            rotation,
            server_identity: None,
            duplex: None,
        })
    }

    /// URL the next attempt will use.
    pub fn current_url(&self) -> &str {
        self.rotation.current()
    }

    /// Identity of the server key in use, once fetched.
    pub fn server_identity(&self) -> Option<&str> {
        self.server_identity.as_deref()
    }

    /// Deliver `upload` and return the server's reply messages.
    ///
    /// Follows redirects immediately and keeps using the redirect target
    /// afterwards. On a transient failure (or a server
    /// presenting the wrong identity) waits out the rotation backoff before
    /// returning the error.
    ///
    /// # Errors
    ///
    /// - `TransportError::Cancelled` once `shutdown` fires
    /// - `TransportError::EnrolmentRequired` if the server does not know us
    /// - any transient error, after its backoff has elapsed
    pub async fn exchange(
        &mut self,
        upload: &Upload,
        shutdown: &mut Shutdown,
    ) -> Result<Vec<Message>, TransportError> {
        let mut redirects = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                () = shutdown.triggered() => return Err(TransportError::Cancelled),
                outcome = self.attempt(upload) => outcome,
            };

            let err = match outcome {
                Ok(Response::Delivered(body)) => {
                    self.rotation.record_success();
                    return Ok(self.open_reply(&body).await);
                },
                Ok(Response::Redirect(url)) if redirects < MAX_REDIRECTS => {
                    redirects += 1;
                    self.rotation.redirect(url);
                    // A different frontend may hold a different key.
                    self.server_identity = None;
                    self.duplex = None;
                    continue;
                },
                Ok(Response::Redirect(url)) => TransportError::Unreachable {
                    url,
                    reason: format!("more than {MAX_REDIRECTS} redirects"),
                },
                Err(err) => err,
            };

            if err.is_transient() || matches!(err, TransportError::ServerIdentityMismatch { .. }) {
                self.back_off(&err, shutdown).await?;
            }
            return Err(err);
        }
    }

    async fn back_off(&mut self, err: &TransportError, shutdown: &mut Shutdown) -> Result<(), TransportError> {
        let url = self.rotation.current().to_string();
        let backoff = self.rotation.record_failure(self.env.jitter(self.cycle_jitter));
        // The server may have rotated its key; fetch it again next attempt.
        self.server_identity = None;
        self.duplex = None;

        let delay = backoff.delay();
        tracing::warn!(
            handler = self.handler.path(),
            %url,
            error = %err,
            ?delay,
            next = %self.rotation.current(),
            "exchange failed"
        );

        tokio::select! {
            biased;
            () = shutdown.triggered() => Err(TransportError::Cancelled),
            () = self.env.sleep(delay) => Ok(()),
        }
    }

    async fn attempt(&mut self, upload: &Upload) -> Result<Response, TransportError> {
        let url = self.rotation.current().to_string();
        let server = self.ensure_server_key(&url).await?;

        let envelope = self
            .crypto
            .encrypt(upload.chunks.clone(), upload.compression, &server)
            .map_err(|e| TransportError::Envelope(e.to_string()))?;

        match self.mode.mode(self.env.now()) {
            ExchangeMode::RequestResponse => {
                self.connector.post(&url, self.handler, envelope, upload.urgent).await
            },
            ExchangeMode::Duplex => {
                let result = self.duplex_exchange(&url, envelope).await;
                match &result {
                    Ok(_) => self.mode.duplex_succeeded(),
                    Err(_) => self.mode.duplex_failed(self.env.now()),
                }
                result
            },
        }
    }

    async fn ensure_server_key(&mut self, url: &str) -> Result<String, TransportError> {
        if let Some(identity) = &self.server_identity {
            return Ok(identity.clone());
        }

        let pem = self.connector.server_key(url).await?;
        let identity = self
            .crypto
            .add_server_key(&pem, self.pinned_server_name.as_deref())
            .map_err(|e| match e {
                CryptoError::IdentityMismatch { claimed, derived } => {
                    TransportError::ServerIdentityMismatch { expected: claimed, actual: derived }
                },
                other => TransportError::Envelope(other.to_string()),
            })?;

        tracing::debug!(%url, server = %identity, "server key installed");
        self.server_identity = Some(identity.clone());
        Ok(identity)
    }

    /// One envelope over the persistent channel, reconnecting if needed.
    ///
    /// The channel is only kept after a successful exchange; any failure
    /// drops it so the next attempt reconnects.
    async fn duplex_exchange(&mut self, url: &str, envelope: Bytes) -> Result<Response, TransportError> {
        let reusable = self
            .duplex
            .take()
            .filter(|state| state.url == url && !state.liveness.is_dead(self.env.now()));
        let mut state = match reusable {
            Some(state) => state,
            None => {
                let channel = self.connector.open_duplex(url, self.handler).await?;
                tracing::debug!(%url, handler = self.handler.path(), "duplex channel open");
                DuplexState {
                    channel,
                    liveness: Liveness::new(self.env.now(), self.liveness),
                    url: url.to_string(),
                }
            },
        };

        state.channel.send(envelope).await?;
        loop {
            let remaining = state.liveness.remaining(self.env.now()).max(Duration::from_millis(1));
            let event = tokio::select! {
                event = state.channel.recv() => event?,
                () = self.env.sleep(remaining) => {
                    let now = self.env.now();
                    if state.liveness.is_dead(now) {
                        return Err(TransportError::LivenessLost { silence: state.liveness.silence(now) });
                    }
                    continue;
                },
            };

            match event {
                DuplexEvent::Ping => state.liveness.on_ping(self.env.now()),
                DuplexEvent::Envelope(reply) => {
                    state.liveness.on_ping(self.env.now());
                    self.duplex = Some(state);
                    return Ok(Response::Delivered(reply));
                },
                DuplexEvent::Closed => {
                    return Err(TransportError::Unreachable {
                        url: url.to_string(),
                        reason: "duplex channel closed by server".to_string(),
                    });
                },
            }
        }
    }

    /// Messages carried by a reply envelope.
    ///
    /// The upload has been delivered by now, so a reply that cannot be used
    /// is logged and dropped rather than failing the exchange.
    async fn open_reply(&self, body: &[u8]) -> Vec<Message> {
        if body.is_empty() {
            return Vec::new();
        }

        let info = match self.crypto.decrypt(body).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decrypt server reply");
                return Vec::new();
            },
        };
        if info.is_empty() {
            return Vec::new();
        }
        if let Err(e) = info.require_authenticated() {
            tracing::warn!(source = %info.source, error = %e, "dropping unauthenticated server reply");
            return Vec::new();
        }
        info.messages().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to decode server reply");
            Vec::new()
        })
    }
}
