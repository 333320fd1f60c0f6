//! Sender pipeline.
//!
//! Two pumps connected by the durable queue:
//!
//! ```text
//! executor ──[Ingest]──> urgent lane / main queue ──[Sender]──> transport
//! ```
//!
//! [`Ingest`] serializes every outbound message as a one-message record and
//! appends it to the urgent lane or the main queue, waiting while the queue
//! is full. [`Sender`] leases a batch, uploads it and commits only after the
//! server accepted it; on any failure it rolls back and the batch goes out
//! again later. A crash between upload and commit replays the batch on
//! restart, so delivery is at-least-once.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use fleetlink_core::{Environment, TransportError};
use fleetlink_proto::{Compression, Message, MessageList};
use fleetlink_queue::{DurableQueue, MemoryQueue, lease_and_compress};
use tokio::sync::Notify;

use crate::{
    connector::Connector,
    dispatch::Dispatcher,
    enroll::Enroller,
    error::ClientError,
    executor::Executor,
    shutdown::Shutdown,
    transport::{Transport, Upload},
};

/// Moves executor output into the queues.
pub struct Ingest<X: Executor> {
    executor: Arc<X>,
    queue: Arc<dyn DurableQueue>,
    urgent: Arc<MemoryQueue>,
    flush: Arc<Notify>,
    max_upload_size: u64,
}

impl<X: Executor> Ingest<X> {
    /// Pump feeding `queue` (and `urgent` for urgent messages).
    ///
    /// `flush` is notified once a full upload is queued, and after every
    /// urgent message.
    pub fn new(
        executor: Arc<X>,
        queue: Arc<dyn DurableQueue>,
        urgent: Arc<MemoryQueue>,
        flush: Arc<Notify>,
        max_upload_size: u64,
    ) -> Self {
        Self { executor, queue, urgent, flush, max_upload_size }
    }

    /// Run until shutdown, the executor finishing, or the queue closing.
    pub async fn run(self, mut shutdown: Shutdown) {
        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                next = self.executor.next_outbound() => next,
            };
            let Some(message) = next else {
                tracing::info!("executor finished, ingest stopping");
                break;
            };

            match self.store(message, &mut shutdown).await {
                Ok(()) => {},
                Err(e) if e.is_shutdown() => break,
                Err(e) => tracing::error!(error = %e, "dropping outbound message"),
            }
        }
    }

    async fn store(&self, message: Message, shutdown: &mut Shutdown) -> Result<(), ClientError> {
        let urgent = message.urgent;
        let record = MessageList::single(message).encode_record()?;
        let queue: Arc<dyn DurableQueue> =
            if urgent { self.urgent.clone() } else { self.queue.clone() };

        // Enqueue waits on a condition variable while the queue is full.
        let enqueue = tokio::task::spawn_blocking(move || queue.enqueue(&record));
        tokio::select! {
            biased;
            () = shutdown.triggered() => return Err(TransportError::Cancelled.into()),
            joined = enqueue => joined??,
        }

        if urgent || self.queue.available_bytes() >= self.max_upload_size {
            self.flush.notify_one();
        }
        Ok(())
    }
}

/// Sender tuning.
#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    /// Compressed bytes per upload
    pub max_upload_size: u64,
    /// Wait between drains when nothing flushes earlier
    pub min_poll: Duration,
    /// Chunk compression
    pub compression: Compression,
}

/// Uploads queued records.
pub struct Sender<E: Environment, C: Connector, X: Executor> {
    env: E,
    queue: Arc<dyn DurableQueue>,
    urgent: Arc<MemoryQueue>,
    transport: Transport<E, C>,
    dispatcher: Arc<Dispatcher<E, X>>,
    enroller: Arc<Enroller<E>>,
    flush: Arc<Notify>,
    paused: Arc<AtomicBool>,
    config: SenderConfig,
}

impl<E: Environment, C: Connector, X: Executor> Sender<E, C, X> {
    /// Drain pump over `queue` and `urgent`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        env: E,
        queue: Arc<dyn DurableQueue>,
        urgent: Arc<MemoryQueue>,
        transport: Transport<E, C>,
        dispatcher: Arc<Dispatcher<E, X>>,
        enroller: Arc<Enroller<E>>,
        flush: Arc<Notify>,
        paused: Arc<AtomicBool>,
        config: SenderConfig,
    ) -> Self {
        Self { env, queue, urgent, transport, dispatcher, enroller, flush, paused, config }
    }

    /// Run until shutdown.
    ///
    /// Drains whenever flushed and at least every `min_poll`. While paused,
    /// records keep accumulating in the queues.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        loop {
            if !self.paused.load(Ordering::Acquire) {
                match self.drain(&mut shutdown).await {
                    Ok(()) => {},
                    Err(e) if e.is_shutdown() => break,
                    Err(e) => tracing::debug!(error = %e, "drain interrupted"),
                }
            }

            tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                () = self.flush.notified() => {},
                () = self.env.sleep(self.config.min_poll) => {},
            }
        }
        tracing::debug!("sender stopped");
    }

    /// Upload until both queues are empty, urgent lane first.
    async fn drain(&mut self, shutdown: &mut Shutdown) -> Result<(), ClientError> {
        while !self.paused.load(Ordering::Acquire) {
            let (queue, urgent): (Arc<dyn DurableQueue>, bool) = if self.urgent.available_bytes() > 0 {
                (self.urgent.clone(), true)
            } else if self.queue.available_bytes() > 0 {
                (self.queue.clone(), false)
            } else {
                break;
            };
            self.send_batch(queue, urgent, shutdown).await?;
        }
        Ok(())
    }

    async fn send_batch(
        &mut self,
        queue: Arc<dyn DurableQueue>,
        urgent: bool,
        shutdown: &mut Shutdown,
    ) -> Result<(), ClientError> {
        let budget = self.config.max_upload_size;
        let compression = self.config.compression;
        let chunks = {
            let queue = queue.clone();
            tokio::task::spawn_blocking(move || lease_and_compress(queue.as_ref(), budget, compression))
                .await??
        };

        if chunks.is_empty() {
            // Everything leased was filtered out by cancellation.
            if queue.leased_bytes() > 0 {
                queue.commit()?;
            }
            return Ok(());
        }

        let upload = Upload { chunks, compression, urgent };
        match self.transport.exchange(&upload, shutdown).await {
            Ok(replies) => {
                let bytes = queue.leased_bytes();
                queue.commit()?;
                tracing::debug!(bytes, urgent, replies = replies.len(), "upload committed");
                for message in replies {
                    self.dispatcher.dispatch(message).await;
                }
                Ok(())
            },
            Err(err) => {
                queue.rollback()?;
                if matches!(err, TransportError::EnrolmentRequired) {
                    self.enroller.enrol()?;
                }
                Err(err.into())
            },
        }
    }
}
