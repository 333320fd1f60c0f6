//! Fleetlink core.
//!
//! Pure logic shared by the endpoint and the server side: the environment
//! abstraction (time and randomness), server URL rotation with backoff, and
//! the full-duplex liveness state machine. Nothing here performs I/O; drivers
//! feed in time and outcomes and act on the returned decisions.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod env;
pub mod error;
pub mod liveness;
pub mod rotation;

pub use env::Environment;
pub use error::TransportError;
pub use liveness::{ExchangeMode, Liveness, LivenessConfig, ModeSelector};
pub use rotation::{Backoff, RotationConfig, ServerRotation};
