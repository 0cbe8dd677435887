//! Discovery errors

use crate::nat::StunError;
use std::net::SocketAddr;
use thiserror::Error;

/// Address resolver errors
///
/// Only configuration errors are fatal. Probe and STUN failures are logged
/// by the resolver and leave the affected identity fields empty.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Local address probe failed
    #[error("local address probe towards {target} failed: {source}")]
    Probe {
        /// Discovery target
        target: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// STUN query failed
    #[error("STUN query to {server} failed: {source}")]
    Stun {
        /// Server as configured
        server: String,
        /// Underlying STUN error
        #[source]
        source: StunError,
    },

    /// Server name did not resolve to an address of the wanted family
    #[error("{0} has no address in the requested family")]
    Unresolvable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),
}
