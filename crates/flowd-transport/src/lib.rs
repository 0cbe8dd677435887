//! # flowd Transport
//!
//! Lifecycle event delivery for flowd:
//!
//! - [`Backend`]: the sink abstraction
//! - [`UdpFireflyBackend`]: firefly datagrams over UDP (default backend)
//! - [`LogBackend`]: one structured log line per event
//! - [`BackendRegistry`]: configured names → async constructors
//! - [`Dispatcher`]: concurrent fan-out with per-send timeouts

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod log_backend;
pub mod registry;
pub mod udp_firefly;

pub use backend::{Backend, BackendCounters, BackendError, BackendResult, BackendStats};
pub use config::{FireflyConfig, TransportConfig};
pub use dispatcher::{BackendOutcome, DispatchReport, Dispatcher};
pub use log_backend::LogBackend;
pub use registry::{BackendFuture, BackendRegistry};
pub use udp_firefly::{Destination, UdpFireflyBackend};
