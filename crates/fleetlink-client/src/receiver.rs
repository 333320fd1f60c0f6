//! Receiver poll loop.
//!
//! In request/response mode the server cannot push. The receiver posts an
//! empty upload to the `reader` handler and the server answers with whatever
//! requests it has queued for this endpoint. Polling speeds up after activity
//! and backs off to `max_poll` (plus jitter) when idle.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use fleetlink_core::{Environment, TransportError};
use fleetlink_proto::Compression;

use crate::{
    connector::Connector,
    dispatch::Dispatcher,
    enroll::Enroller,
    executor::Executor,
    shutdown::Shutdown,
    transport::{Transport, Upload},
};

/// Receiver tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    /// Wait after a poll that returned requests, or failed
    pub min_poll: Duration,
    /// Wait after an idle poll
    pub max_poll: Duration,
    /// Random addition to `max_poll`
    pub max_poll_jitter: Duration,
    /// Compression tag for the (empty) poll upload
    pub compression: Compression,
}

/// Polls the server for requests.
pub struct Receiver<E: Environment, C: Connector, X: Executor> {
    env: E,
    transport: Transport<E, C>,
    dispatcher: Arc<Dispatcher<E, X>>,
    enroller: Arc<Enroller<E>>,
    paused: Arc<AtomicBool>,
    config: ReceiverConfig,
}

impl<E: Environment, C: Connector, X: Executor> Receiver<E, C, X> {
    /// Poll loop over `transport`, which must target [`crate::Handler::Reader`].
    pub fn new(
        env: E,
        transport: Transport<E, C>,
        dispatcher: Arc<Dispatcher<E, X>>,
        enroller: Arc<Enroller<E>>,
        paused: Arc<AtomicBool>,
        config: ReceiverConfig,
    ) -> Self {
        Self { env, transport, dispatcher, enroller, paused, config }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        loop {
            let wait = if self.paused.load(Ordering::Acquire) {
                self.config.min_poll
            } else {
                match self.poll(&mut shutdown).await {
                    Ok(0) => self.config.max_poll + self.env.jitter(self.config.max_poll_jitter),
                    Ok(_) => self.config.min_poll,
                    Err(TransportError::Cancelled) => break,
                    Err(TransportError::EnrolmentRequired) => {
                        if let Err(e) = self.enroller.enrol() {
                            tracing::error!(error = %e, "failed to queue enrolment");
                        }
                        self.config.min_poll
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "poll failed");
                        self.config.min_poll
                    },
                }
            };

            tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                () = self.env.sleep(wait) => {},
            }
        }
        tracing::debug!("receiver stopped");
    }

    /// One poll. Returns the number of requests dispatched.
    async fn poll(&mut self, shutdown: &mut Shutdown) -> Result<usize, TransportError> {
        let upload = Upload { chunks: Vec::new(), compression: self.config.compression, urgent: false };
        let requests = self.transport.exchange(&upload, shutdown).await?;
        let count = requests.len();
        if count > 0 {
            tracing::debug!(count, "received server requests");
        }
        for message in requests {
            self.dispatcher.dispatch(message).await;
        }
        Ok(count)
    }
}
