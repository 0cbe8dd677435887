//! Backend trait abstraction for lifecycle event sinks.
//!
//! A backend receives every [`LifecycleEvent`] the tracker emits and delivers
//! it somewhere: a firefly collector, the log, a test recorder. Delivery is
//! best effort. A failing backend is counted and logged by the dispatcher and
//! never influences flow tracking.

use async_trait::async_trait;
use flowd_core::{FireflyError, LifecycleEvent};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Backend errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Event could not be encoded
    #[error("encoding failed: {0}")]
    Encode(#[from] FireflyError),

    /// Backend is closed
    #[error("Backend is closed")]
    Closed,

    /// Delivery did not finish within the send timeout
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// No constructor registered under this name
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend-specific error
    #[error("Backend error: {0}")]
    Other(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Sink for lifecycle events
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registry name of the backend
    fn name(&self) -> &str;

    /// Deliver one event
    ///
    /// # Errors
    /// Returns `BackendError` if delivery failed; the event is not retried
    async fn accept(&self, event: &LifecycleEvent) -> BackendResult<()>;

    /// Release resources; later calls to `accept` fail with `Closed`
    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }

    /// Delivery counters
    fn stats(&self) -> BackendStats {
        BackendStats::default()
    }
}

/// Backend delivery statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Events delivered
    pub events_sent: u64,
    /// Events that failed to deliver
    pub send_errors: u64,
    /// Payload bytes handed to the network
    pub bytes_sent: u64,
}

/// Lock-free counters backing [`BackendStats`]
#[derive(Debug, Default)]
pub struct BackendCounters {
    events_sent: AtomicU64,
    send_errors: AtomicU64,
    bytes_sent: AtomicU64,
}

impl BackendCounters {
    /// Record a successful delivery of `bytes`
    pub fn record_sent(&self, bytes: usize) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a failed delivery
    pub fn record_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    #[must_use]
    pub fn snapshot(&self) -> BackendStats {
        BackendStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}
