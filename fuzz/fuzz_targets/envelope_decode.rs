//! Fuzz target for Envelope::decode
//!
//! Envelopes arrive from the network before any authentication, so the
//! decoder sees fully attacker-controlled bytes.
//!
//! # Invariants
//!
//! - NEVER panics, only returns Err for invalid data
//! - Length fields are bounded before allocation
//! - Anything that decodes re-encodes to the same bytes

#![no_main]

use fleetlink_proto::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::decode(data) {
        let encoded = envelope.to_bytes().expect("decoded envelope must encode");
        assert_eq!(&encoded[..], data, "decode/encode is not canonical");
    }
});
