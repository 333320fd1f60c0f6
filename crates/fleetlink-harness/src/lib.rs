//! Deterministic test support for fleetlink.
//!
//! - [`SimEnv`]: [`fleetlink_core::Environment`] with a seeded RNG and the
//!   tokio clock, so tests can pause time
//! - [`test_key`]: fixed RSA keys, generated once per test binary
//! - [`SimServer`]: in-process server implementing
//!   [`fleetlink_client::Connector`], with knobs for outages, redirects,
//!   enrolment and dead duplex channels

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod sim_env;
pub mod sim_server;

pub use fixtures::{TEST_KEY_BITS, test_key};
pub use sim_env::SimEnv;
pub use sim_server::{SimDuplex, SimServer};
