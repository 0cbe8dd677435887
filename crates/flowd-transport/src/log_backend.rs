//! Structured log backend: one `info` line per lifecycle event.

use crate::backend::{Backend, BackendCounters, BackendError, BackendResult, BackendStats};
use crate::config::LOG;
use async_trait::async_trait;
use flowd_core::LifecycleEvent;
use std::sync::atomic::{AtomicBool, Ordering};

/// Logs events through `tracing` under the `flowd::events` target
#[derive(Debug, Default)]
pub struct LogBackend {
    closed: AtomicBool,
    counters: BackendCounters,
}

impl LogBackend {
    /// Create a log backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for LogBackend {
    fn name(&self) -> &str {
        LOG
    }

    async fn accept(&self, event: &LifecycleEvent) -> BackendResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BackendError::Closed);
        }

        let family = event.identity.for_addr(&event.key.local.ip());
        tracing::info!(
            target: "flowd::events",
            kind = %event.kind,
            sequence = event.sequence,
            protocol = %event.key.protocol,
            local = %event.key.local,
            remote = %event.key.remote,
            experiment = event.activity.experiment_id,
            activity = event.activity.activity_id,
            public = ?family.public,
            "flow lifecycle"
        );
        self.counters.record_sent(0);
        Ok(())
    }

    async fn close(&self) -> BackendResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot()
    }
}
