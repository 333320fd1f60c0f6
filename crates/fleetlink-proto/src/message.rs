//! Application messages and their record framing.
//!
//! Messages are CBOR-encoded for forward compatibility. A [`MessageList`] is
//! the unit stored in the durable queue; on the wire each list becomes a
//! record:
//!
//! ```text
//! u32 length (Big Endian) || CBOR(MessageList)
//! ```
//!
//! Records concatenate cleanly, so any run of queue records is itself a valid
//! record stream and [`decode_records`] recovers every message in order.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    codec::{get_u32, take},
    errors::{ProtocolError, Result},
};

/// A single application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Flow (session) this message belongs to. Empty for session-less traffic.
    pub session_id: String,
    /// Request sequence number within the flow
    pub request_id: u64,
    /// Identity of the producer
    pub source: String,
    /// Urgent messages bypass the durable queue
    pub urgent: bool,
    /// Message body
    pub payload: MessagePayload,
}

/// Message body variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Rows produced by a query, as JSON lines
    QueryResponse {
        /// Query name
        query: String,
        /// Result rows, one JSON object per line
        jsonl: String,
        /// Number of rows in `jsonl`
        total_rows: u64,
    },
    /// Log line emitted by a flow
    Log {
        /// Severity
        level: String,
        /// Log text
        message: String,
    },
    /// Progress statistics for a flow
    FlowStats {
        /// Rows uploaded so far
        total_rows: u64,
        /// Bytes uploaded so far
        total_uploaded_bytes: u64,
        /// Flow has finished
        completed: bool,
    },
    /// Enrolment request carrying the endpoint's public key
    Enrolment {
        /// PKCS#1 PEM encoded public key
        public_key_pem: String,
    },
    /// Server request for the executor
    Request {
        /// Query name
        name: String,
        /// Query body
        query: String,
    },
    /// Cancel the flow named by `session_id`
    Cancel,
    /// Ask the endpoint process to exit
    Kill,
}

/// Discriminant of [`MessagePayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`MessagePayload::QueryResponse`]
    QueryResponse,
    /// [`MessagePayload::Log`]
    Log,
    /// [`MessagePayload::FlowStats`]
    FlowStats,
    /// [`MessagePayload::Enrolment`]
    Enrolment,
    /// [`MessagePayload::Request`]
    Request,
    /// [`MessagePayload::Cancel`]
    Cancel,
    /// [`MessagePayload::Kill`]
    Kill,
}

impl Message {
    /// Payload discriminant.
    pub fn kind(&self) -> MessageKind {
        match self.payload {
            MessagePayload::QueryResponse { .. } => MessageKind::QueryResponse,
            MessagePayload::Log { .. } => MessageKind::Log,
            MessagePayload::FlowStats { .. } => MessageKind::FlowStats,
            MessagePayload::Enrolment { .. } => MessageKind::Enrolment,
            MessagePayload::Request { .. } => MessageKind::Request,
            MessagePayload::Cancel => MessageKind::Cancel,
            MessagePayload::Kill => MessageKind::Kill,
        }
    }

    /// Logs and flow statistics are delivered even for cancelled flows so the
    /// server learns how the flow ended.
    pub fn survives_cancellation(&self) -> bool {
        matches!(self.kind(), MessageKind::Log | MessageKind::FlowStats)
    }
}

/// An ordered batch of messages; one durable queue record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageList {
    /// Messages in production order
    pub messages: Vec<Message>,
}

impl MessageList {
    /// Largest single record body accepted (16 MiB)
    pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

    /// Wrap a single message.
    pub fn single(message: Message) -> Self {
        Self { messages: vec![message] }
    }

    /// Encode as one framed record.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    /// - `ProtocolError::FieldTooLarge` if the body exceeds `MAX_RECORD_SIZE`
    pub fn encode_record(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(self, &mut body)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        if body.len() > Self::MAX_RECORD_SIZE {
            return Err(ProtocolError::FieldTooLarge {
                field: "record",
                size: body.len(),
                max: Self::MAX_RECORD_SIZE,
            });
        }

        let mut out = Vec::with_capacity(4 + body.len());
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode exactly one framed record.
    pub fn decode_record(record: &[u8]) -> Result<Self> {
        let mut src = record;
        let list = Self::decode_next(&mut src)?;
        crate::codec::ensure_empty(src)?;
        Ok(list)
    }

    fn decode_next(src: &mut &[u8]) -> Result<Self> {
        let len = get_u32(src)? as usize;
        if len > Self::MAX_RECORD_SIZE {
            return Err(ProtocolError::FieldTooLarge {
                field: "record",
                size: len,
                max: Self::MAX_RECORD_SIZE,
            });
        }
        let body = take(src, len)?;
        ciborium::de::from_reader(body).map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }
}

/// Decode a concatenation of framed records into a flat message sequence.
pub fn decode_records(mut bytes: &[u8]) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    while !bytes.is_empty() {
        messages.extend(MessageList::decode_next(&mut bytes)?.messages);
    }
    Ok(messages)
}
