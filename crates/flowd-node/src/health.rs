//! Health monitoring
//!
//! Tracks consecutive poll failures. A single failed scan is routine (the
//! cycle is skipped); a run of them means the node cannot see connections
//! and is reported as degraded, then critical. One successful poll restores
//! `Healthy`.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Polls are succeeding
    Healthy,

    /// Several consecutive polls failed; flows may be missed
    Degraded,

    /// Polling has been failing for a long time; tracking is blind
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

/// Health monitoring configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive poll failures before `Degraded`
    pub degraded_after: u32,

    /// Consecutive poll failures before `Critical`
    pub critical_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            critical_after: 10,
        }
    }
}

/// Health metrics snapshot
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Current health status
    pub status: HealthStatus,

    /// Failed polls since the last success
    pub consecutive_failures: u32,

    /// Polls attempted
    pub total_polls: u64,

    /// Polls that failed
    pub total_failures: u64,

    /// Last status transition time
    pub last_transition: Instant,

    /// Times degraded state was entered
    pub degraded_count: u64,

    /// Times critical state was entered
    pub critical_count: u64,

    /// Times recovered to healthy
    pub recovery_count: u64,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            total_polls: 0,
            total_failures: 0,
            last_transition: Instant::now(),
            degraded_count: 0,
            critical_count: 0,
            recovery_count: 0,
        }
    }
}

/// Health monitor
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    metrics: Arc<RwLock<HealthMetrics>>,
}

impl HealthMonitor {
    /// Create a new health monitor
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(HealthMetrics::default())),
        }
    }

    /// Record a successful poll
    pub async fn record_success(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.total_polls += 1;
        metrics.consecutive_failures = 0;
        self.transition(&mut metrics);
    }

    /// Record a failed poll
    pub async fn record_failure(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.total_polls += 1;
        metrics.total_failures += 1;
        metrics.consecutive_failures = metrics.consecutive_failures.saturating_add(1);
        self.transition(&mut metrics);
    }

    fn transition(&self, metrics: &mut HealthMetrics) {
        let new_status = self.determine_status(metrics.consecutive_failures);
        if new_status == metrics.status {
            return;
        }

        match new_status {
            HealthStatus::Healthy => {
                metrics.recovery_count += 1;
                tracing::info!(from = %metrics.status, "connection polling recovered");
            }
            HealthStatus::Degraded => {
                metrics.degraded_count += 1;
                tracing::warn!(
                    failures = metrics.consecutive_failures,
                    "connection polling degraded"
                );
            }
            HealthStatus::Critical => {
                metrics.critical_count += 1;
                tracing::error!(
                    failures = metrics.consecutive_failures,
                    "connection polling critical"
                );
            }
        }
        metrics.status = new_status;
        metrics.last_transition = Instant::now();
    }

    fn determine_status(&self, consecutive_failures: u32) -> HealthStatus {
        if consecutive_failures >= self.config.critical_after {
            HealthStatus::Critical
        } else if consecutive_failures >= self.config.degraded_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Get current health status
    pub async fn status(&self) -> HealthStatus {
        self.metrics.read().await.status
    }

    /// Get current health metrics
    pub async fn metrics(&self) -> HealthMetrics {
        self.metrics.read().await.clone()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
