//! Boundary between the transport pipeline and local work.
//!
//! The [`Executor`] runs whatever the server asks for and produces the
//! messages that flow back. The pipeline only moves messages; it never looks
//! inside query results.

use std::future::Future;

use fleetlink_proto::Message;
use tokio::sync::{Mutex, mpsc};

/// Source of outbound messages and sink for server requests.
pub trait Executor: Send + Sync + 'static {
    /// Next message to deliver to the server.
    ///
    /// Returns `None` once the executor has shut down.
    fn next_outbound(&self) -> impl Future<Output = Option<Message>> + Send;

    /// Handle a request from the server.
    fn process_request(&self, message: Message) -> impl Future<Output = ()> + Send;
}

/// [`Executor`] backed by channels.
///
/// The application side holds an [`ExecutorHandle`]: it pushes results into
/// `outbound` and receives server requests from `requests`.
pub struct ChannelExecutor {
    outbound: Mutex<mpsc::Receiver<Message>>,
    requests: mpsc::Sender<Message>,
}

/// Application side of a [`ChannelExecutor`].
pub struct ExecutorHandle {
    /// Messages for the server
    pub outbound: mpsc::Sender<Message>,
    /// Requests from the server
    pub requests: mpsc::Receiver<Message>,
}

impl ChannelExecutor {
    /// Executor and its handle, with channels of `capacity` messages.
    pub fn new(capacity: usize) -> (Self, ExecutorHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (requests_tx, requests_rx) = mpsc::channel(capacity);
        (
            Self { outbound: Mutex::new(outbound_rx), requests: requests_tx },
            ExecutorHandle { outbound: outbound_tx, requests: requests_rx },
        )
    }
}

impl Executor for ChannelExecutor {
    async fn next_outbound(&self) -> Option<Message> {
        self.outbound.lock().await.recv().await
    }

    async fn process_request(&self, message: Message) {
        if self.requests.send(message).await.is_err() {
            tracing::warn!("executor handle dropped, discarding server request");
        }
    }
}
