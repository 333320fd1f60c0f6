//! Fuzz target for the plaintext layers inside an envelope
//!
//! A peer that holds a valid session can still send arbitrary plaintext, so
//! the packed list, chunk decompression and record framing must hold up on
//! their own.
//!
//! # Strategy
//!
//! - Random bytes: arbitrary packed lists and record streams
//! - Huge lengths: record prefixes claiming up to 4 GiB
//! - Deep nesting: CBOR arrays nested to arbitrary depth
//! - Zlib bombs: highly compressible chunks near the inflate limit
//!
//! # Invariants
//!
//! - NEVER panics on malformed input
//! - Claimed lengths are rejected, not allocated
//! - Inflation stops at the per-chunk limit

#![no_main]

use arbitrary::Arbitrary;
use fleetlink_proto::{Compression, MessageList, PackedMessageList, decode_records};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum Attack {
    RandomPacked { bytes: Vec<u8> },
    RandomRecords { bytes: Vec<u8> },
    HugeLength { claimed: u32, tail: Vec<u8> },
    DeeplyNested { depth: u8 },
    ZlibBomb { fill: u8, size_kib: u16 },
}

fuzz_target!(|attack: Attack| {
    match attack {
        Attack::RandomPacked { bytes } => {
            if let Ok(packed) = PackedMessageList::decode(&bytes) {
                let _ = packed.messages();
            }
        },

        Attack::RandomRecords { bytes } => {
            let _ = decode_records(&bytes);
            let _ = MessageList::decode_record(&bytes);
        },

        Attack::HugeLength { claimed, tail } => {
            let mut bytes = claimed.to_be_bytes().to_vec();
            bytes.extend(tail);
            let _ = decode_records(&bytes);
        },

        Attack::DeeplyNested { depth } => {
            let depth = usize::from(depth);
            let mut body = vec![0x81; depth];
            body.push(0x01);
            let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
            bytes.extend(body);
            let _ = decode_records(&bytes);
        },

        Attack::ZlibBomb { fill, size_kib } => {
            let raw = vec![fill; usize::from(size_kib) * 1024];
            let Ok(chunk) = Compression::Zlib.compress(&raw) else {
                return;
            };
            let packed = PackedMessageList {
                compression: Compression::Zlib,
                message_list: vec![chunk.into()],
                nonce: String::new(),
                timestamp: 0,
            };
            if let Ok(encoded) = packed.encode() {
                if let Ok(decoded) = PackedMessageList::decode(&encoded) {
                    let _ = decoded.messages();
                }
            }
        },
    }
});
