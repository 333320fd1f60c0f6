//! Property-based tests for server rotation.
//!
//! Whatever sequence of outcomes the network produces, the rotation must keep
//! pointing at a configured URL, never wait longer than the configured
//! ceilings, and declare the whole server list unreachable exactly once per
//! full pass without a success.

use std::time::Duration;

use fleetlink_core::{Backoff, RotationConfig, ServerRotation};
use proptest::prelude::*;

fn config(retries: u32) -> RotationConfig {
    RotationConfig {
        initial_backoff: Duration::from_millis(250),
        max_backoff: Duration::from_secs(8),
        retries_per_url: retries,
        cycle_wait: Duration::from_secs(60),
        cycle_jitter: Duration::from_secs(30),
    }
}

proptest! {
    #[test]
    fn delays_are_bounded(
        url_count in 1usize..5,
        retries in 1u32..6,
        outcomes in prop::collection::vec((any::<bool>(), 0u64..100_000), 1..200),
    ) {
        let urls: Vec<String> = (0..url_count).map(|i| format!("https://s{i}/")).collect();
        let mut rotation = ServerRotation::new(urls.clone(), config(retries), 0).unwrap();

        for (ok, jitter_ms) in outcomes {
            if ok {
                rotation.record_success();
            } else {
                let backoff = rotation.record_failure(Duration::from_millis(jitter_ms));
                prop_assert!(backoff.delay() <= Duration::from_secs(90));
                if let Backoff::Retry { delay } = backoff {
                    prop_assert!(delay <= Duration::from_secs(8));
                }
            }
            prop_assert!(urls.iter().any(|u| u == rotation.current()));
        }
    }

    #[test]
    fn exhaustion_once_per_full_pass(url_count in 1usize..5, retries in 1u32..6, passes in 1usize..4) {
        let urls: Vec<String> = (0..url_count).map(|i| format!("https://s{i}/")).collect();
        let mut rotation = ServerRotation::new(urls, config(retries), 0).unwrap();

        let per_pass = url_count * retries as usize;
        let mut exhausted = 0;
        for _ in 0..per_pass * passes {
            if let Backoff::Advance { exhausted: true, .. } = rotation.record_failure(Duration::ZERO) {
                exhausted += 1;
            }
        }
        prop_assert_eq!(exhausted, passes);
        prop_assert_eq!(rotation.index(), 0);
    }
}
