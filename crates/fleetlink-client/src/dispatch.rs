//! Routing of server requests.
//!
//! Replies to sender uploads and receiver polls both carry server requests.
//! Control requests (cancel, kill) are acted on here; everything else goes to
//! the [`Executor`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use fleetlink_core::Environment;
use fleetlink_proto::{Message, MessagePayload};

use crate::{cancel::CancelRegistry, executor::Executor};

/// Callback run when the server asks the process to exit.
pub type KillSwitch = Arc<dyn Fn() + Send + Sync>;

/// Routes inbound server messages.
pub struct Dispatcher<E: Environment, X: Executor> {
    env: E,
    executor: Arc<X>,
    cancel: CancelRegistry,
    kill_grace: Duration,
    on_kill: KillSwitch,
    killed: AtomicBool,
}

impl<E: Environment, X: Executor> Dispatcher<E, X> {
    /// Dispatcher handing requests to `executor`.
    pub fn new(
        env: E,
        executor: Arc<X>,
        cancel: CancelRegistry,
        kill_grace: Duration,
        on_kill: KillSwitch,
    ) -> Self {
        Self { env, executor, cancel, kill_grace, on_kill, killed: AtomicBool::new(false) }
    }

    /// Handle one server message.
    ///
    /// A cancel is recorded before the executor hears of it, so nothing the
    /// flow buffered afterwards is uploaded.
    pub async fn dispatch(&self, message: Message) {
        match message.payload {
            MessagePayload::Cancel => {
                self.cancel.cancel(&message.session_id);
                self.executor.process_request(message).await;
            },
            MessagePayload::Kill => self.kill(),
            _ => self.executor.process_request(message).await,
        }
    }

    /// Run the kill switch once, after the grace delay.
    fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(grace = ?self.kill_grace, "server requested exit");

        let env = self.env.clone();
        let grace = self.kill_grace;
        let on_kill = self.on_kill.clone();
        tokio::spawn(async move {
            env.sleep(grace).await;
            on_kill();
        });
    }
}
