//! Error types for the flowd core.

use std::time::Duration;
use thiserror::Error;

/// Connection poller errors
///
/// All variants are transient: the pipeline treats a failed poll as
/// "no change" for that cycle and retries on the next tick.
#[derive(Debug, Error)]
pub enum PollError {
    /// The scan did not complete within the configured bound
    #[error("connection scan timed out after {0:?}")]
    Timeout(Duration),

    /// A connection table could not be read
    #[error("failed to read connection table {table}: {source}")]
    Table {
        /// Table path or name
        table: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Poller-specific failure
    #[error("enumeration failed: {0}")]
    Other(String),
}

/// Firefly codec errors
#[derive(Debug, Error)]
pub enum FireflyError {
    /// JSON serialization or parsing failed
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Datagram is not a syslog-framed firefly message
    #[error("malformed firefly envelope: {0}")]
    Envelope(&'static str),

    /// Datagram is not valid UTF-8
    #[error("datagram is not valid UTF-8")]
    Utf8,

    /// Message exceeds the maximum datagram size
    #[error("encoded message too large: {0} bytes")]
    TooLarge(usize),
}
