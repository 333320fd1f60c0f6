//! Enrolment.
//!
//! A server that does not know an endpoint answers its uploads with
//! [`fleetlink_core::TransportError::EnrolmentRequired`]. The endpoint then
//! sends its public key as an urgent message; the server registers it and
//! later envelopes authenticate normally.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use fleetlink_core::Environment;
use fleetlink_crypto::CryptoManager;
use fleetlink_proto::{Message, MessageList, MessagePayload};
use fleetlink_queue::MemoryQueue;
use tokio::sync::Notify;

use crate::error::ClientError;

/// Queues enrolment messages, at most one per interval.
pub struct Enroller<E: Environment> {
    env: E,
    crypto: Arc<CryptoManager<E>>,
    urgent: Arc<MemoryQueue>,
    flush: Arc<Notify>,
    interval: Duration,
    last_attempt: Mutex<Option<E::Instant>>,
}

impl<E: Environment> Enroller<E> {
    /// Enroller feeding the urgent lane `urgent` and waking the drain pump
    /// through `flush`.
    pub fn new(
        env: E,
        crypto: Arc<CryptoManager<E>>,
        urgent: Arc<MemoryQueue>,
        flush: Arc<Notify>,
        interval: Duration,
    ) -> Self {
        Self { env, crypto, urgent, flush, interval, last_attempt: Mutex::new(None) }
    }

    /// Queue an enrolment message unless one was queued within the interval.
    ///
    /// Never waits: if the urgent lane is full the attempt is skipped and the
    /// next enrolment request retries.
    ///
    /// Returns true if a message was queued.
    pub fn enrol(&self) -> Result<bool, ClientError> {
        let now = self.env.now();
        {
            let mut last = self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|last| now - last < self.interval) {
                return Ok(false);
            }
            *last = Some(now);
        }

        let message = Message {
            session_id: String::new(),
            request_id: 0,
            source: self.crypto.identity().to_string(),
            urgent: true,
            payload: MessagePayload::Enrolment {
                public_key_pem: self.crypto.key_material().public_key_pem()?,
            },
        };
        let record = MessageList::single(message).encode_record()?;

        if !self.urgent.try_enqueue(&record)? {
            tracing::warn!("urgent lane full, enrolment deferred");
            *self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner) = None;
            return Ok(false);
        }
        tracing::info!(identity = %self.crypto.identity(), "enrolling with server");
        self.flush.notify_one();
        Ok(true)
    }
}
