//! Endpoint wiring.
//!
//! [`Communicator`] builds the queues, transports and pumps from a
//! [`ClientConfig`] and runs them as three tasks:
//!
//! - ingest: executor output into the queues
//! - sender: queues to the `control` handler
//! - receiver: polls of the `reader` handler into the executor
//!
//! [`Communicator::shutdown`] stops all three, rolls back any in-flight
//! lease and closes the queues. A file-backed buffer keeps its file, so
//! unsent records go out after the next start.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use fleetlink_core::Environment;
use fleetlink_crypto::CryptoManager;
use fleetlink_proto::Compression;
use fleetlink_queue::{DurableQueue, FileQueue, LeaseFilter, MemoryQueue, QueueStats};
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    cancel::CancelRegistry,
    config::{ClientConfig, LocalBufferConfig},
    connector::{Connector, Handler},
    dispatch::{Dispatcher, KillSwitch},
    enroll::Enroller,
    error::ClientError,
    executor::Executor,
    receiver::{Receiver, ReceiverConfig},
    sender::{Ingest, Sender, SenderConfig},
    shutdown::{Shutdown, ShutdownTrigger, shutdown_channel},
    transport::Transport,
};

/// Open the main outbound buffer.
///
/// Uses a file when a disk size and filename are configured: persistent
/// files are reopened and replayed, otherwise the file is created private and
/// unlinked. If the file cannot be opened the endpoint keeps running on an
/// in-memory buffer.
pub fn open_local_buffer(config: &LocalBufferConfig, filter: Arc<dyn LeaseFilter>) -> Arc<dyn DurableQueue> {
    if config.disk_size > 0
        && let Some(path) = &config.filename
    {
        match open_file_buffer(path, config, filter.clone()) {
            Ok(queue) => return Arc::new(queue),
            Err(e) => tracing::error!(
                path = %path.display(),
                error = %e,
                "cannot open buffer file, falling back to memory buffer"
            ),
        }
    }
    tracing::info!(max_size = config.memory_size, "using memory buffer");
    Arc::new(MemoryQueue::with_filter("memory", config.memory_size, filter))
}

fn open_file_buffer(
    path: &Path,
    config: &LocalBufferConfig,
    filter: Arc<dyn LeaseFilter>,
) -> Result<FileQueue, ClientError> {
    let queue = if config.persistent {
        FileQueue::open_with_filter(path, config.disk_size, filter)?
    } else {
        FileQueue::create_ephemeral(path, config.disk_size, filter)?
    };
    Ok(queue)
}

/// Running endpoint.
pub struct Communicator<E: Environment> {
    crypto: Arc<CryptoManager<E>>,
    queue: Arc<dyn DurableQueue>,
    urgent: Arc<MemoryQueue>,
    cancel: CancelRegistry,
    paused: Arc<AtomicBool>,
    flush: Arc<Notify>,
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
}

impl<E: Environment> Communicator<E> {
    /// Build everything from `config` and spawn the pumps.
    ///
    /// `on_kill` runs when the server asks the process to exit.
    ///
    /// # Errors
    ///
    /// - `ClientError::Transport` if no server URLs are configured
    pub fn start<C: Connector, X: Executor>(
        env: E,
        config: &ClientConfig,
        crypto: Arc<CryptoManager<E>>,
        connector: Arc<C>,
        executor: Arc<X>,
        on_kill: KillSwitch,
    ) -> Result<Self, ClientError> {
        let cancel = CancelRegistry::new();
        let filter: Arc<dyn LeaseFilter> = Arc::new(cancel.clone());
        let queue = open_local_buffer(&config.buffer, filter.clone());
        let urgent = Arc::new(MemoryQueue::with_filter("urgent", config.urgent_capacity(), filter));

        let compression = if config.compression { Compression::Zlib } else { Compression::None };
        let flush = Arc::new(Notify::new());
        let paused = Arc::new(AtomicBool::new(false));
        let (trigger, shutdown) = shutdown_channel();

        let control = Transport::new(
            env.clone(),
            connector.clone(),
            crypto.clone(),
            Handler::Control,
            &config.transport,
        )?;
        let reader =
            Transport::new(env.clone(), connector, crypto.clone(), Handler::Reader, &config.transport)?;

        let dispatcher = Arc::new(Dispatcher::new(
            env.clone(),
            executor.clone(),
            cancel.clone(),
            config.kill_grace,
            on_kill,
        ));
        let enroller = Arc::new(Enroller::new(
            env.clone(),
            crypto.clone(),
            urgent.clone(),
            flush.clone(),
            config.enrolment_interval,
        ));

        let ingest =
            Ingest::new(executor, queue.clone(), urgent.clone(), flush.clone(), config.max_upload_size);
        let sender = Sender::new(
            env.clone(),
            queue.clone(),
            urgent.clone(),
            control,
            dispatcher.clone(),
            enroller.clone(),
            flush.clone(),
            paused.clone(),
            SenderConfig {
                max_upload_size: config.max_upload_size,
                min_poll: config.min_poll,
                compression,
            },
        );
        let receiver = Receiver::new(
            env,
            reader,
            dispatcher,
            enroller,
            paused.clone(),
            ReceiverConfig {
                min_poll: config.min_poll,
                max_poll: config.max_poll,
                max_poll_jitter: config.max_poll_jitter,
                compression,
            },
        );

        let tasks = vec![
            tokio::spawn(ingest.run(shutdown.clone())),
            tokio::spawn(sender.run(shutdown.clone())),
            tokio::spawn(receiver.run(shutdown)),
        ];
        tracing::info!(
            identity = %crypto.identity(),
            servers = config.transport.server_urls.len(),
            "communicator started"
        );

        Ok(Self { crypto, queue, urgent, cancel, paused, flush, trigger, tasks })
    }

    /// Local identity.
    pub fn identity(&self) -> &str {
        self.crypto.identity()
    }

    /// Stop uploading and polling. Outbound records keep queueing.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::info!("communicator paused");
    }

    /// Resume after [`Communicator::pause`] and drain immediately.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.flush.notify_one();
        tracing::info!("communicator resumed");
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Main buffer snapshot.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Urgent lane snapshot.
    pub fn urgent_stats(&self) -> QueueStats {
        self.urgent.stats()
    }

    /// Cancelled flows.
    pub fn cancel_registry(&self) -> &CancelRegistry {
        &self.cancel
    }

    /// Shutdown signal shared with the pumps.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.trigger.subscribe()
    }

    /// Stop the pumps and close the queues.
    pub async fn shutdown(self) {
        self.trigger.trigger();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "pump task failed");
            }
        }
        self.urgent.close();
        self.queue.close();
        tracing::info!("communicator stopped");
    }
}
