//! Per-flow cancellation.
//!
//! When the server cancels a flow, everything that flow already buffered
//! would otherwise still be uploaded. The [`CancelRegistry`] is installed as
//! the buffer's [`LeaseFilter`]: leased records lose the cancelled flow's
//! messages, except logs and flow statistics, which still tell the server how
//! the flow ended.
//!
//! This is data-plane cancellation only. Process shutdown is separate.

use std::{
    borrow::Cow,
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use fleetlink_proto::MessageList;
use fleetlink_queue::LeaseFilter;

/// Set of cancelled flow (session) ids.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl CancelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `session_id` cancelled.
    pub fn cancel(&self, session_id: &str) {
        let inserted = self
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string());
        if inserted {
            tracing::info!(%session_id, "flow cancelled");
        }
    }

    /// True if `session_id` was cancelled.
    pub fn is_cancelled(&self, session_id: &str) -> bool {
        !session_id.is_empty()
            && self.cancelled.lock().unwrap_or_else(PoisonError::into_inner).contains(session_id)
    }

    /// Number of cancelled flows.
    pub fn len(&self) -> usize {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing is cancelled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LeaseFilter for CancelRegistry {
    fn filter<'a>(&self, record: &'a [u8]) -> Cow<'a, [u8]> {
        if self.is_empty() {
            return Cow::Borrowed(record);
        }
        // Records we cannot parse are passed on untouched; the server decides.
        let Ok(mut list) = MessageList::decode_record(record) else {
            return Cow::Borrowed(record);
        };

        let before = list.messages.len();
        list.messages.retain(|m| m.survives_cancellation() || !self.is_cancelled(&m.session_id));
        if list.messages.len() == before {
            return Cow::Borrowed(record);
        }
        if list.messages.is_empty() {
            return Cow::Owned(Vec::new());
        }
        match list.encode_record() {
            Ok(filtered) => Cow::Owned(filtered),
            Err(_) => Cow::Borrowed(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use fleetlink_proto::{Message, MessagePayload, decode_records};

    use super::*;

    fn message(session: &str, payload: MessagePayload) -> Message {
        Message {
            session_id: session.to_string(),
            request_id: 0,
            source: "C.0123456789abcdef".to_string(),
            urgent: false,
            payload,
        }
    }

    fn rows(session: &str) -> Message {
        message(
            session,
            MessagePayload::QueryResponse {
                query: "q".to_string(),
                jsonl: "{}\n".to_string(),
                total_rows: 1,
            },
        )
    }

    fn log(session: &str) -> Message {
        message(
            session,
            MessagePayload::Log { level: "INFO".to_string(), message: "cancelled".to_string() },
        )
    }

    #[test]
    fn untouched_without_cancellations() {
        let registry = CancelRegistry::new();
        let record = MessageList::single(rows("F.1")).encode_record().unwrap();
        assert!(matches!(registry.filter(&record), Cow::Borrowed(_)));
    }

    #[test]
    fn cancelled_rows_removed_logs_kept() {
        let registry = CancelRegistry::new();
        registry.cancel("F.1");

        let list = MessageList { messages: vec![rows("F.1"), log("F.1"), rows("F.2")] };
        let record = list.encode_record().unwrap();
        let filtered = registry.filter(&record);

        let kept = decode_records(&filtered).unwrap();
        assert_eq!(kept, vec![log("F.1"), rows("F.2")]);
    }

    #[test]
    fn fully_cancelled_record_becomes_empty() {
        let registry = CancelRegistry::new();
        registry.cancel("F.1");
        let record = MessageList::single(rows("F.1")).encode_record().unwrap();
        assert!(registry.filter(&record).is_empty());
    }

    #[test]
    fn unparsable_records_pass_through() {
        let registry = CancelRegistry::new();
        registry.cancel("F.1");
        assert_eq!(registry.filter(b"not a record").as_ref(), b"not a record");
    }
}
