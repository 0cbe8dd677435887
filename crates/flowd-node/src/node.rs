//! Flow tracking node
//!
//! The [`Node`] wires the components together and owns their tasks: the
//! address resolver refreshes the identity cache in the background while the
//! [`Pipeline`] polls, tracks and dispatches on its own interval.

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::health::{HealthMetrics, HealthMonitor, HealthStatus};
use crate::pipeline::Pipeline;
use flowd_core::{
    Classifier, ConnectionPoller, FlowTracker, ProcNetPoller, ResolvedIdentity, TrackerStats,
};
use flowd_discovery::AddressResolver;
use flowd_transport::{BackendRegistry, Dispatcher};
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Handles of a running node's tasks
struct RunningTasks {
    shutdown: watch::Sender<bool>,
    pipeline: JoinHandle<TrackerStats>,
    resolver: JoinHandle<()>,
}

/// Node inner state
struct NodeInner {
    config: NodeConfig,
    poller: Arc<dyn ConnectionPoller>,
    registry: BackendRegistry,
    resolver: Arc<AddressResolver>,
    health: HealthMonitor,
    running: AtomicBool,
    tasks: Mutex<Option<RunningTasks>>,
}

/// Flow lifecycle tracking node
///
/// Cheap to clone; clones share the same tasks and state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("poller", &self.inner.poller.name())
            .field("backends", &self.inner.config.transport.backends)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Node {
    /// Node reading `/proc/net` with the built-in backends
    ///
    /// # Errors
    /// Returns the first configuration problem found; the node cannot start
    /// until it is fixed.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let poller = ProcNetPoller::with_root(&config.poll.proc_root, config.poll.filter.clone());
        Self::with_parts(config, Arc::new(poller), BackendRegistry::with_builtins())
    }

    /// Node with a caller-supplied poller and backend registry
    ///
    /// # Errors
    /// Same as [`Node::new`].
    pub fn with_parts(
        config: NodeConfig,
        poller: Arc<dyn ConnectionPoller>,
        registry: BackendRegistry,
    ) -> Result<Self> {
        config.validate()?;
        config.validate_backends(&registry)?;

        let resolver = Arc::new(AddressResolver::new(config.resolver.clone()));
        let health = HealthMonitor::new(config.health.clone());

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                poller,
                registry,
                resolver,
                health,
                running: AtomicBool::new(false),
                tasks: Mutex::new(None),
            }),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start the node
    ///
    /// Resolves the identity once, builds the backends, then spawns the
    /// resolver and pipeline tasks.
    ///
    /// # Errors
    /// [`NodeError::InvalidState`] if already running, or the backend
    /// construction error.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::InvalidState(Cow::Borrowed("Node already running")));
        }

        match self.spawn_tasks().await {
            Ok(tasks) => {
                *self.inner.tasks.lock().await = Some(tasks);
                tracing::info!(
                    poller = self.inner.poller.name(),
                    backends = ?self.inner.config.transport.backends,
                    interval = ?self.inner.config.poll.interval,
                    "node started"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn spawn_tasks(&self) -> Result<RunningTasks> {
        let config = &self.inner.config;

        let identity = self.inner.resolver.refresh().await;
        if identity.is_empty() {
            tracing::warn!("no source address resolved; events will carry no source");
        }

        let dispatcher = Dispatcher::from_config(&self.inner.registry, &config.transport).await?;
        let tracker = FlowTracker::new(
            config.tracker.clone(),
            Classifier::new(config.classifier.clone()),
        );
        let pipeline = Pipeline::new(
            Arc::clone(&self.inner.poller),
            tracker,
            dispatcher,
            self.inner.resolver.handle(),
            self.inner.health.clone(),
            config.poll.timeout,
        );

        let (shutdown, rx) = watch::channel(false);

        let resolver = Arc::clone(&self.inner.resolver);
        let resolver_rx = rx.clone();
        let resolver = tokio::spawn(async move { resolver.run(resolver_rx).await });

        let pipeline = tokio::spawn(pipeline.run(config.poll.interval, config.shutdown_grace, rx));

        Ok(RunningTasks {
            shutdown,
            pipeline,
            resolver,
        })
    }

    /// Stop the node
    ///
    /// Signals shutdown, waits for the pipeline to flush END events for every
    /// tracked flow, and returns the final tracker statistics.
    ///
    /// # Errors
    /// [`NodeError::InvalidState`] if not running; [`NodeError::TaskJoin`] if
    /// the pipeline task panicked.
    pub async fn stop(&self) -> Result<TrackerStats> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::InvalidState(Cow::Borrowed("Node not running")));
        }

        let Some(tasks) = self.inner.tasks.lock().await.take() else {
            return Err(NodeError::InvalidState(Cow::Borrowed("Node tasks missing")));
        };

        tracing::info!("stopping node");
        let _ = tasks.shutdown.send(true);

        let stats = tasks
            .pipeline
            .await
            .map_err(|e| NodeError::TaskJoin(format!("pipeline task: {e}").into()))?;

        // a STUN query may still be in flight
        let mut resolver = tasks.resolver;
        if tokio::time::timeout(self.inner.config.shutdown_grace, &mut resolver)
            .await
            .is_err()
        {
            tracing::warn!("resolver did not stop in time, aborting");
            resolver.abort();
        }

        tracing::info!(
            cycles = stats.cycles,
            started = stats.started,
            ended = stats.ended,
            "node stopped"
        );
        Ok(stats)
    }

    /// Start, run until `signal` resolves, then stop
    ///
    /// # Errors
    /// Any error from [`Node::start`] or [`Node::stop`].
    pub async fn run_until<F>(&self, signal: F) -> Result<TrackerStats>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.stop().await
    }

    /// Check if node is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Latest resolved source identity
    #[must_use]
    pub fn identity(&self) -> Arc<ResolvedIdentity> {
        self.inner.resolver.handle().current()
    }

    /// Poll health status
    pub async fn health(&self) -> HealthStatus {
        self.inner.health.status().await
    }

    /// Poll health counters
    pub async fn health_metrics(&self) -> HealthMetrics {
        self.inner.health.metrics().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowd_core::{FlowKey, PollError, Snapshot};
    use std::time::Duration;

    struct Steady;

    #[async_trait]
    impl ConnectionPoller for Steady {
        async fn poll(&self) -> std::result::Result<Snapshot, PollError> {
            Ok(Snapshot::from_keys([FlowKey::tcp(
                "10.0.0.5:5001".parse().unwrap(),
                "198.51.100.9:443".parse().unwrap(),
            )]))
        }

        fn name(&self) -> &'static str {
            "steady"
        }
    }

    fn quiet_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.poll.interval = Duration::from_millis(10);
        config.resolver.stun_enabled = false;
        config.resolver.v4_target = Some("127.0.0.1:9".parse().unwrap());
        config.resolver.v6_target = None;
        config.transport.backends = vec!["log".into()];
        config.shutdown_grace = Duration::from_millis(200);
        config
    }

    fn node() -> Node {
        Node::with_parts(
            quiet_config(),
            Arc::new(Steady),
            BackendRegistry::with_builtins(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let node = node();
        assert!(!node.is_running());
        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.start().await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stats = node.stop().await.unwrap();
        assert!(!node.is_running());
        assert!(node.stop().await.is_err());

        assert_eq!(stats.started, 1);
        assert_eq!(stats.ended, 1);
        assert_eq!(node.health().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_identity_resolved_on_start() {
        let node = node();
        assert!(node.identity().is_empty());
        node.start().await.unwrap();
        let identity = node.identity();
        assert_eq!(identity.v4.local, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(identity.v6.local, None);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until() {
        let node = node();
        let stats = node
            .run_until(tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(stats.cycles >= 1);
        assert!(!node.is_running());
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = quiet_config();
        config.transport.backends = vec!["kafka".into()];
        let err = Node::with_parts(config, Arc::new(Steady), BackendRegistry::with_builtins())
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_node_reads_proc_tree() {
        // 10.0.0.5:5001 -> 198.51.100.9:443, established
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("net")).unwrap();
        std::fs::write(
            dir.path().join("net").join("tcp"),
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   \
             0: 0500000A:1389 096433C6:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 4242 1\n",
        )
        .unwrap();

        let mut config = quiet_config();
        config.poll.proc_root = dir.path().to_path_buf();
        config.poll.filter.protocols = vec![flowd_core::Protocol::Tcp];
        let node = Node::new(config).unwrap();

        let stats = node
            .run_until(tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.ended, 1);
    }

    #[tokio::test]
    async fn test_failed_start_resets_state() {
        let mut config = quiet_config();
        config.transport.backends = vec!["udp_firefly".into()];
        config.transport.firefly.collector = Some("collector.invalid:10514".into());
        let node = Node::with_parts(config, Arc::new(Steady), BackendRegistry::with_builtins())
            .unwrap();

        assert!(node.start().await.is_err());
        assert!(!node.is_running());
    }
}
