//! Node configuration
//!
//! Everything the daemon needs, gathered once at startup and handed to each
//! component constructor.

use crate::error::{NodeError, Result};
use crate::health::HealthConfig;
use flowd_core::{ClassifierConfig, ContinueCadence, PollFilter, TrackerConfig};
use flowd_discovery::{ResolverConfig, validate_host_port};
use flowd_transport::{BackendRegistry, TransportConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Default work directory
pub const DEFAULT_WORK_DIR: &str = "/var/cache/flowd";

/// Default PID file
pub const DEFAULT_PID_FILE: &str = "/var/run/flowd.pid";

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Connection polling
    pub poll: PollConfig,

    /// Lifecycle tracking
    pub tracker: TrackerConfig,

    /// Activity classification
    pub classifier: ClassifierConfig,

    /// Source identity discovery
    pub resolver: ResolverConfig,

    /// Event delivery
    pub transport: TransportConfig,

    /// Health thresholds
    pub health: HealthConfig,

    /// How long an in-flight cycle may run after shutdown is requested
    pub shutdown_grace: Duration,

    /// Filesystem locations
    pub paths: PathsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            tracker: TrackerConfig::default(),
            classifier: ClassifierConfig::default(),
            resolver: ResolverConfig::default(),
            transport: TransportConfig::default(),
            health: HealthConfig::default(),
            shutdown_grace: Duration::from_secs(5),
            paths: PathsConfig::default(),
        }
    }
}

/// Connection polling configuration
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Time between poll cycles
    pub interval: Duration,

    /// Upper bound for a single scan
    pub timeout: Duration,

    /// Which connections are reported
    pub filter: PollFilter,

    /// Root of the proc filesystem
    pub proc_root: PathBuf,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
            filter: PollFilter::default(),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Filesystem locations
///
/// Kept for operators and packaging; daemonization and PID-file handling are
/// left to the service manager.
#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Work/cache directory
    pub work_dir: PathBuf,

    /// PID file
    pub pid_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
        }
    }
}

impl NodeConfig {
    /// Check every startup-fatal condition
    ///
    /// # Errors
    /// Returns [`NodeError::InvalidConfig`] (or the resolver's equivalent)
    /// describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval.is_zero() {
            return Err(invalid("poll interval must be non-zero"));
        }
        if self.poll.timeout.is_zero() {
            return Err(invalid("poll timeout must be non-zero"));
        }
        if self.poll.filter.protocols.is_empty() {
            return Err(invalid("at least one protocol must be polled"));
        }
        if self.poll.filter.states.is_empty() {
            return Err(invalid("at least one connection state must be accepted"));
        }

        match self.tracker.cadence {
            ContinueCadence::EveryCycles(0) => {
                return Err(invalid("continue cadence must be at least one cycle"));
            }
            ContinueCadence::Interval(d) if d.is_zero() => {
                return Err(invalid("continue interval must be non-zero"));
            }
            _ => {}
        }

        self.resolver.validate()?;

        if self.transport.backends.is_empty() {
            return Err(invalid("at least one backend must be configured"));
        }
        if self.transport.send_timeout.is_zero() {
            return Err(invalid("send timeout must be non-zero"));
        }
        if let Some(collector) = &self.transport.firefly.collector {
            validate_host_port(collector)
                .map_err(|e| NodeError::InvalidConfig(format!("collector {e}").into()))?;
        }
        if self.transport.firefly.port == 0 {
            return Err(invalid("firefly port must be non-zero"));
        }

        if self.health.degraded_after == 0 || self.health.critical_after < self.health.degraded_after
        {
            return Err(invalid(
                "health thresholds must satisfy 0 < degraded_after <= critical_after",
            ));
        }
        Ok(())
    }

    /// Check configured backend names against `registry`
    ///
    /// # Errors
    /// Returns [`NodeError::Backend`] with the first unknown name
    pub fn validate_backends(&self, registry: &BackendRegistry) -> Result<()> {
        registry.check(&self.transport)?;
        Ok(())
    }
}

fn invalid(msg: &'static str) -> NodeError {
    NodeError::InvalidConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        config
            .validate_backends(&BackendRegistry::with_builtins())
            .unwrap();
        assert_eq!(config.poll.timeout, Duration::from_secs(10));
        assert_eq!(config.transport.backends, vec!["udp_firefly".to_string()]);
        assert_eq!(config.paths.pid_file, PathBuf::from("/var/run/flowd.pid"));
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let mut config = NodeConfig::default();
        config.tracker.cadence = ContinueCadence::EveryCycles(0);
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));

        config.tracker.cadence = ContinueCadence::Interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_malformed_collector_rejected() {
        let mut config = NodeConfig::default();
        config.transport.firefly.collector = Some("collector.example".into());
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));

        config.transport.firefly.collector = Some("collector.example:10514".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_malformed_discovery_target_rejected() {
        let mut config = NodeConfig::default();
        config.resolver.v6_target = "10.255.255.255:1".parse().ok();
        assert!(matches!(config.validate(), Err(NodeError::Resolver(_))));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = NodeConfig::default();
        config.transport.backends = vec!["udp_firefly".into(), "kafka".into()];
        config.validate().unwrap();
        let err = config
            .validate_backends(&BackendRegistry::with_builtins())
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = NodeConfig::default();
        config.poll.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.transport.send_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
