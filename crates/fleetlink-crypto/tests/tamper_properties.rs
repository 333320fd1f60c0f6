//! Property-based tests for envelope tampering.
//!
//! Any modification of an envelope in transit must be rejected. Which error
//! depends on what was hit: framing damage fails to parse, a damaged key
//! blob fails RSA decryption, and everything else fails the integrity check.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use fleetlink_crypto::{CryptoConfig, CryptoError, CryptoManager, InMemoryResolver, PublicKeyResolver};
use fleetlink_harness::{SimEnv, test_key};
use fleetlink_proto::{Compression, Envelope, IV_SIZE, Message, MessageList, MessagePayload};
use proptest::prelude::*;

fn sealed() -> &'static (Bytes, Vec<Message>) {
    static SEALED: OnceLock<(Bytes, Vec<Message>)> = OnceLock::new();
    SEALED.get_or_init(|| {
        let (a, b) = (test_key(0), test_key(1));
        let resolver = InMemoryResolver::new();
        resolver.add(b.identity(), b.public_key()).unwrap();
        let sender = CryptoManager::new(SimEnv::new(), a.clone(), Arc::new(resolver), CryptoConfig::default());

        let list = MessageList::single(Message {
            session_id: "F.7".to_string(),
            request_id: 7,
            source: a.identity().to_string(),
            urgent: false,
            payload: MessagePayload::QueryResponse {
                query: "processes".to_string(),
                jsonl: "{\"pid\":1}\n{\"pid\":2}\n".to_string(),
                total_rows: 2,
            },
        });
        let envelope = sender.encrypt_messages(&[list.clone()], Compression::Zlib, b.identity()).unwrap();
        (envelope, list.messages)
    })
}

/// Fresh receiver per case so no case benefits from another's cached session.
fn receiver() -> CryptoManager<SimEnv> {
    let a = test_key(0);
    let resolver = InMemoryResolver::new();
    resolver.add(a.identity(), a.public_key()).unwrap();
    CryptoManager::new(SimEnv::new(), test_key(1), Arc::new(resolver), CryptoConfig::default())
}

/// Part of the sealed envelope a byte offset falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    /// Magic and length prefixes
    Framing,
    /// RSA-encrypted session key
    KeyBlob,
    /// Everything covered by the HMAC or bound to the key blob
    Protected,
}

fn region(at: usize) -> Region {
    let decoded = Envelope::decode(&sealed().0).unwrap();
    let key_blob = 8..8 + decoded.encrypted_cipher.len();
    let metadata_len = key_blob.end..key_blob.end + 4;
    let payload_len_at = metadata_len.end + decoded.encrypted_metadata.len() + IV_SIZE;
    let payload_len = payload_len_at..payload_len_at + 4;

    if at < 8 || metadata_len.contains(&at) || payload_len.contains(&at) {
        Region::Framing
    } else if key_blob.contains(&at) {
        Region::KeyBlob
    } else {
        Region::Protected
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap()
}

#[test]
fn untampered_envelope_opens() {
    let (envelope, messages) = sealed();
    let info = runtime().block_on(receiver().decrypt(envelope)).unwrap();
    assert!(info.authenticated);
    assert_eq!(&info.messages().unwrap(), messages);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn flipped_bit_is_rejected(position in any::<prop::sample::Index>(), bit in 0u8..8) {
        let (envelope, _) = sealed();
        let mut tampered = envelope.to_vec();
        let at = position.index(tampered.len());
        tampered[at] ^= 1 << bit;

        let result = runtime().block_on(receiver().decrypt(&tampered));
        prop_assert!(result.is_err(), "byte {at}: tampered envelope opened");
        let err = result.unwrap_err();
        prop_assert!(err.is_fatal());
        match region(at) {
            Region::Framing => {
                prop_assert!(matches!(err, CryptoError::MalformedEnvelope(_)), "byte {at}: {err:?}");
            },
            Region::KeyBlob => prop_assert_eq!(err, CryptoError::KeyDecryption),
            Region::Protected => {
                prop_assert!(matches!(err, CryptoError::Integrity(_)), "byte {at}: {err:?}");
            },
        }
    }

    #[test]
    fn truncation_is_rejected(keep in any::<prop::sample::Index>()) {
        let (envelope, _) = sealed();
        let keep = keep.index(envelope.len());
        let result = runtime().block_on(receiver().decrypt(&envelope[..keep]));
        prop_assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))), "{result:?}");
    }

    #[test]
    fn appended_bytes_are_rejected(extra in prop::collection::vec(any::<u8>(), 1..32)) {
        let (envelope, _) = sealed();
        let mut tampered = envelope.to_vec();
        tampered.extend(extra);
        let result = runtime().block_on(receiver().decrypt(&tampered));
        prop_assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))), "{result:?}");
    }

    #[test]
    fn spliced_payload_is_rejected(replacement in prop::collection::vec(any::<u8>(), 16..64)) {
        let (envelope, _) = sealed();
        let mut decoded = Envelope::decode(envelope).unwrap();
        let len = replacement.len() / 16 * 16;
        decoded.encrypted_payload = Bytes::from(replacement[..len].to_vec());
        let tampered = decoded.to_bytes().unwrap();

        let result = runtime().block_on(receiver().decrypt(&tampered));
        prop_assert!(matches!(result, Err(CryptoError::Integrity(_))), "{result:?}");
    }
}
