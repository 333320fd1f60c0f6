//! Fixed RSA keys.
//!
//! RSA key generation dominates test time, so every test binary generates a
//! small pool once from fixed seeds and hands out clones.

use std::sync::OnceLock;

use fleetlink_crypto::KeyMaterial;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Modulus size of the fixture keys (the smallest accepted).
pub const TEST_KEY_BITS: usize = 1024;

const POOL_SIZE: usize = 4;

static KEYS: OnceLock<Vec<KeyMaterial>> = OnceLock::new();

/// Fixture key `index` (modulo the pool size). Same index, same key.
#[allow(clippy::expect_used)]
pub fn test_key(index: usize) -> KeyMaterial {
    let keys = KEYS.get_or_init(|| {
        (0..POOL_SIZE)
            .map(|i| {
                let mut rng = ChaCha20Rng::seed_from_u64(0xf1ee_7000 + i as u64);
                KeyMaterial::generate(&mut rng, TEST_KEY_BITS)
                    .expect("invariant: TEST_KEY_BITS is a supported key size")
            })
            .collect()
    });
    keys[index % POOL_SIZE].clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_distinct() {
        assert_eq!(test_key(0).identity(), test_key(0).identity());
        assert_ne!(test_key(0).identity(), test_key(1).identity());
        assert_eq!(test_key(1).bits(), TEST_KEY_BITS);
    }
}
