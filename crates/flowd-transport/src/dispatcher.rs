//! Backend Dispatcher
//!
//! Fans each cycle's lifecycle events out to every configured backend. Every
//! backend runs in its own task and gets the send timeout for the whole
//! batch: events it has not accepted by then are counted as timed out. A
//! dispatch therefore takes at most one send timeout regardless of batch
//! size, and a slow or failing backend neither blocks nor drops events for
//! the others.

use crate::backend::{Backend, BackendError, BackendStats};
use crate::config::TransportConfig;
use crate::registry::BackendRegistry;
use flowd_core::LifecycleEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Per-backend result of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOutcome {
    /// Backend name
    pub backend: String,
    /// Events accepted
    pub delivered: usize,
    /// Events rejected with an error
    pub failed: usize,
    /// Events not accepted before the batch deadline
    pub timed_out: usize,
}

/// Result of dispatching one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Events in the batch
    pub events: usize,
    /// One entry per backend, in configuration order
    pub outcomes: Vec<BackendOutcome>,
}

impl DispatchReport {
    /// Total successful deliveries across backends
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().map(|o| o.delivered).sum()
    }

    /// Total failed or timed-out deliveries across backends
    #[must_use]
    pub fn failures(&self) -> usize {
        self.outcomes.iter().map(|o| o.failed + o.timed_out).sum()
    }
}

/// Delivers event batches to a fixed set of backends
#[derive(Clone)]
pub struct Dispatcher {
    backends: Vec<Arc<dyn Backend>>,
    send_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backends", &self.backend_names())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher over already-constructed backends
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn Backend>>, send_timeout: Duration) -> Self {
        Self {
            backends,
            send_timeout,
        }
    }

    /// Build the configured backends through `registry`
    ///
    /// # Errors
    /// Unknown backend names and constructor failures are returned as-is;
    /// both are fatal at startup.
    pub async fn from_config(
        registry: &BackendRegistry,
        config: &TransportConfig,
    ) -> Result<Self, BackendError> {
        let backends = registry.build(config).await?;
        Ok(Self::new(backends, config.send_timeout))
    }

    /// Backend names in configuration order
    #[must_use]
    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Per-backend statistics in configuration order
    #[must_use]
    pub fn stats(&self) -> Vec<(String, BackendStats)> {
        self.backends
            .iter()
            .map(|b| (b.name().to_string(), b.stats()))
            .collect()
    }

    /// Deliver `events` to every backend and wait for all of them, at most
    /// one send timeout
    pub async fn dispatch(&self, events: Vec<LifecycleEvent>) -> DispatchReport {
        let count = events.len();
        if count == 0 || self.backends.is_empty() {
            return DispatchReport {
                events: count,
                outcomes: Vec::new(),
            };
        }

        let events: Arc<[LifecycleEvent]> = events.into();
        let handles: Vec<(String, JoinHandle<BackendOutcome>)> = self
            .backends
            .iter()
            .map(|backend| {
                let name = backend.name().to_string();
                let task = tokio::spawn(deliver(
                    Arc::clone(backend),
                    Arc::clone(&events),
                    self.send_timeout,
                ));
                (name, task)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(backend = %name, error = %e, "backend task panicked");
                    BackendOutcome {
                        backend: name,
                        failed: count,
                        ..BackendOutcome::default()
                    }
                }
            };
            outcomes.push(outcome);
        }

        DispatchReport {
            events: count,
            outcomes,
        }
    }

    /// Close every backend, logging failures
    pub async fn close(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.close().await {
                tracing::warn!(backend = backend.name(), error = %e, "backend close failed");
            }
        }
    }
}

async fn deliver(
    backend: Arc<dyn Backend>,
    events: Arc<[LifecycleEvent]>,
    send_timeout: Duration,
) -> BackendOutcome {
    let mut outcome = BackendOutcome {
        backend: backend.name().to_string(),
        ..BackendOutcome::default()
    };
    let deadline = Instant::now() + send_timeout;

    for (index, event) in events.iter().enumerate() {
        match tokio::time::timeout_at(deadline, backend.accept(event)).await {
            Ok(Ok(())) => outcome.delivered += 1,
            Ok(Err(e)) => {
                outcome.failed += 1;
                tracing::warn!(
                    backend = %outcome.backend,
                    flow = %event.key,
                    kind = %event.kind,
                    error = %e,
                    "event delivery failed"
                );
            }
            Err(_) => {
                outcome.timed_out = events.len() - index;
                tracing::warn!(
                    backend = %outcome.backend,
                    abandoned = outcome.timed_out,
                    timeout = ?send_timeout,
                    "batch delivery timed out"
                );
                break;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendResult;
    use async_trait::async_trait;
    use flowd_core::{ActivityId, EventKind, FlowKey, ResolvedIdentity};
    use std::sync::Mutex;
    use std::time::SystemTime;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Backend for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn accept(&self, event: &LifecycleEvent) -> BackendResult<()> {
            self.seen.lock().unwrap().push(event.sequence);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Backend for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn accept(&self, _event: &LifecycleEvent) -> BackendResult<()> {
            Err(BackendError::Other("collector down".into()))
        }
    }

    struct Stuck;

    #[async_trait]
    impl Backend for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn accept(&self, _event: &LifecycleEvent) -> BackendResult<()> {
            std::future::pending().await
        }
    }

    fn events(n: u64) -> Vec<LifecycleEvent> {
        (0..n)
            .map(|sequence| LifecycleEvent {
                key: FlowKey::tcp(
                    "10.0.0.5:5001".parse().unwrap(),
                    "198.51.100.9:443".parse().unwrap(),
                ),
                kind: EventKind::Continue,
                timestamp: SystemTime::now(),
                flow_start: SystemTime::now(),
                sequence,
                activity: ActivityId::UNCLASSIFIED,
                identity: Arc::new(ResolvedIdentity::default()),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failing_backend_does_not_starve_others() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(
            vec![
                Arc::new(Failing) as Arc<dyn Backend>,
                Arc::new(Stuck) as Arc<dyn Backend>,
                Arc::clone(&recorder) as Arc<dyn Backend>,
            ],
            Duration::from_millis(20),
        );

        let report = dispatcher.dispatch(events(3)).await;
        assert_eq!(report.events, 3);
        assert_eq!(report.outcomes[0].failed, 3);
        assert_eq!(report.outcomes[1].timed_out, 3);
        assert_eq!(report.outcomes[2].delivered, 3);
        assert_eq!(report.delivered(), 3);
        assert_eq!(report.failures(), 6);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1, 2]);
    }

    /// Accepts every event, slowly
    struct Slow;

    #[async_trait]
    impl Backend for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn accept(&self, _event: &LifecycleEvent) -> BackendResult<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stuck_backend_bounded_per_batch() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(
            vec![
                Arc::new(Stuck) as Arc<dyn Backend>,
                Arc::clone(&recorder) as Arc<dyn Backend>,
            ],
            Duration::from_millis(20),
        );

        let started = std::time::Instant::now();
        let report = dispatcher.dispatch(events(200)).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(500), "dispatch took {elapsed:?}");
        assert_eq!(report.outcomes[0].timed_out, 200);
        assert_eq!(report.outcomes[0].delivered, 0);
        assert_eq!(report.outcomes[1].delivered, 200);
        assert_eq!(recorder.seen.lock().unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_slow_backend_cut_off_at_deadline() {
        let dispatcher = Dispatcher::new(
            vec![Arc::new(Slow) as Arc<dyn Backend>],
            Duration::from_millis(50),
        );

        let started = std::time::Instant::now();
        let report = dispatcher.dispatch(events(100)).await;
        let elapsed = started.elapsed();

        let outcome = &report.outcomes[0];
        assert!(elapsed < Duration::from_millis(500), "dispatch took {elapsed:?}");
        assert!(outcome.timed_out > 0);
        assert!(outcome.delivered < 100);
        assert_eq!(outcome.delivered + outcome.timed_out, 100);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dispatcher = Dispatcher::new(
            vec![Arc::new(Failing) as Arc<dyn Backend>],
            Duration::from_millis(20),
        );
        let report = dispatcher.dispatch(Vec::new()).await;
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = TransportConfig {
            backends: vec!["log".into()],
            ..TransportConfig::default()
        };
        let dispatcher = Dispatcher::from_config(&BackendRegistry::with_builtins(), &config)
            .await
            .unwrap();
        assert_eq!(dispatcher.backend_names(), vec!["log"]);
        dispatcher.dispatch(events(2)).await;
        assert_eq!(dispatcher.stats()[0].1.events_sent, 2);
    }
}
