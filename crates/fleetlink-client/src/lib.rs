//! Fleetlink endpoint runtime.
//!
//! Glue between the pure pieces ([`fleetlink_core`], [`fleetlink_crypto`],
//! [`fleetlink_queue`]) and real I/O: HTTP via reqwest, tokio tasks, the
//! system clock and OS randomness.
//!
//! # Components
//!
//! - [`Communicator`]: builds and runs the pumps from a [`ClientConfig`]
//! - [`Ingest`] and [`Sender`]: executor output through the durable queue to
//!   the server, with lease/commit/rollback around every upload
//! - [`Receiver`]: polls the server for requests
//! - [`Transport`]: rotation, backoff, server key pinning and duplex
//!   liveness over a [`Connector`]
//! - [`HttpConnector`]: production [`Connector`]
//! - [`SystemEnv`]: production environment

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod communicator;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod enroll;
pub mod error;
pub mod executor;
pub mod http;
pub mod receiver;
pub mod sender;
pub mod shutdown;
mod system_env;
pub mod transport;

pub use cancel::CancelRegistry;
pub use communicator::{Communicator, open_local_buffer};
pub use config::{ClientConfig, DEFAULT_MAX_UPLOAD_SIZE, LocalBufferConfig, TransportConfig};
pub use connector::{Connector, DuplexChannel, DuplexEvent, Handler, NoDuplex, Response};
pub use dispatch::{Dispatcher, KillSwitch};
pub use enroll::Enroller;
pub use error::ClientError;
pub use executor::{ChannelExecutor, Executor, ExecutorHandle};
pub use http::{HttpConnector, URGENT_HEADER};
pub use receiver::{Receiver, ReceiverConfig};
pub use sender::{Ingest, Sender, SenderConfig};
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_channel};
pub use system_env::SystemEnv;
pub use transport::{Transport, Upload};
