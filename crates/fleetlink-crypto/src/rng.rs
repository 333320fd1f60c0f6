//! `RngCore` adapter over an [`Environment`].
//!
//! The RSA implementation wants a `rand_core` generator for key generation
//! and OAEP padding. Routing it through the environment keeps every random
//! byte the protocol consumes reproducible under a seeded test environment.

use fleetlink_core::Environment;
use rand::{CryptoRng, RngCore};

/// Cryptographic RNG drawing from an environment.
///
/// # Security
///
/// Only as strong as `E::random_bytes`. Production environments use the OS
/// RNG.
pub struct EnvRng<'a, E: Environment>(pub &'a E);

impl<E: Environment> RngCore for EnvRng<'_, E> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.0.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.random_bytes(dest);
        Ok(())
    }
}

impl<E: Environment> CryptoRng for EnvRng<'_, E> {}
