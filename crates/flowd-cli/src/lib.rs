//! flowd command-line support
//!
//! The configuration file model lives here so it can be shared by the `flowd`
//! binary and the fuzz targets.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;

pub use config::{Config, DEFAULT_CONFIG_PATH};
