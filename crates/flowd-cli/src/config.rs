//! Configuration file for the flowd daemon.
//!
//! The file is TOML. Every key is optional; missing keys take the daemon
//! defaults. Durations are human-readable (`"10s"`, `"5m"`).
//!
//! ```toml
//! [poll]
//! interval = "10s"
//! protocols = ["tcp"]
//!
//! [tracker]
//! continue_every = 6
//! grace_cycles = 1
//!
//! [[classifier.rules]]
//! name = "xrootd"
//! local_ports = ["1094"]
//! experiment_id = 2
//! activity_id = 1
//!
//! [transport]
//! backends = ["udp_firefly", "log"]
//! collector = "collector.example.org:10514"
//! ```

use anyhow::{Context, anyhow};
use flowd_core::{
    ActivityId, ClassificationRule, ClassifierConfig, ConnState, ContinueCadence, PortRange,
    Protocol, TrackerConfig,
};
use flowd_node::{HealthConfig, NodeConfig, PathsConfig, PollConfig};
use flowd_transport::{FireflyConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/flowd/flowd.toml";

/// flowd configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Daemon paths and shutdown
    pub daemon: DaemonSection,
    /// Logging
    pub logging: LoggingSection,
    /// Connection polling
    pub poll: PollSection,
    /// Lifecycle tracking
    pub tracker: TrackerSection,
    /// Activity classification
    pub classifier: ClassifierSection,
    /// Address discovery
    pub resolver: ResolverSection,
    /// Event delivery
    pub transport: TransportSection,
    /// Poll health thresholds
    pub health: HealthSection,
}

/// Daemon paths and shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSection {
    /// Work/cache directory
    pub work_dir: PathBuf,
    /// PID file
    pub pid_file: PathBuf,
    /// Time an in-flight cycle may take after shutdown is requested
    pub shutdown_grace: String,
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// Log level or `EnvFilter` directive
    pub level: String,
}

/// Connection polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSection {
    /// Time between cycles
    pub interval: String,
    /// Upper bound for one scan
    pub timeout: String,
    /// `tcp`, `udp`
    pub protocols: Vec<String>,
    /// Accepted states (`established`, `syn-sent`, ...)
    pub states: Vec<String>,
    /// Local port ranges (`"443"`, `"5000-5100"`); empty matches any
    pub local_ports: Vec<String>,
    /// Remote port ranges; empty matches any
    pub remote_ports: Vec<String>,
    /// Report loopback connections
    pub include_loopback: bool,
    /// Root of the proc filesystem
    pub proc_root: PathBuf,
}

/// Lifecycle tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerSection {
    /// Emit CONTINUE every this many observations
    pub continue_every: u32,
    /// Emit CONTINUE on this wall-clock period instead; overrides `continue_every`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_interval: Option<String>,
    /// Consecutive missed cycles tolerated before END
    pub grace_cycles: u32,
}

/// Activity classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierSection {
    /// Track flows no rule matches
    pub track_unclassified: bool,
    /// Experiment id for unmatched flows
    pub default_experiment_id: u32,
    /// Activity id for unmatched flows
    pub default_activity_id: u32,
    /// Ordered rules, first match wins
    pub rules: Vec<RuleSection>,
}

/// One classification rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSection {
    /// Rule name
    pub name: String,
    /// Restrict to `tcp` or `udp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Local port ranges
    #[serde(default)]
    pub local_ports: Vec<String>,
    /// Remote port ranges
    #[serde(default)]
    pub remote_ports: Vec<String>,
    /// Experiment id
    pub experiment_id: u32,
    /// Activity id
    pub activity_id: u32,
}

/// Address discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverSection {
    /// Resolve an IPv4 identity
    pub ipv4: bool,
    /// Resolve an IPv6 identity
    pub ipv6: bool,
    /// IPv4 probe target
    pub v4_target: String,
    /// IPv6 probe target
    pub v6_target: String,
    /// Probe TTL / hop limit
    pub hop_limit: u32,
    /// Query STUN for the public mapping
    pub stun: bool,
    /// STUN servers, tried in order
    pub stun_servers: Vec<String>,
    /// Per-server STUN timeout
    pub stun_timeout: String,
    /// Refresh period
    pub refresh_interval: String,
    /// How long an unconfirmed public mapping is kept
    pub public_validity: String,
}

/// Event delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    /// Backend names
    pub backends: Vec<String>,
    /// Per-backend deadline for one batch of events
    pub send_timeout: String,
    /// Fixed collector `host:port`; unset sends to each flow's remote address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collector: Option<String>,
    /// Firefly port used without a collector
    pub port: u16,
    /// Hostname for the syslog header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// UDP socket send buffer size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_buffer_size: Option<usize>,
}

/// Poll health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSection {
    /// Consecutive failures before `degraded`
    pub degraded_after: u32,
    /// Consecutive failures before `critical`
    pub critical_after: u32,
}

// Default values come from the library defaults so the two never drift

impl Default for DaemonSection {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            work_dir: node.paths.work_dir,
            pid_file: node.paths.pid_file,
            shutdown_grace: format_duration(node.shutdown_grace),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PollSection {
    fn default() -> Self {
        let poll = PollConfig::default();
        Self {
            interval: format_duration(poll.interval),
            timeout: format_duration(poll.timeout),
            protocols: poll.filter.protocols.iter().map(ToString::to_string).collect(),
            states: poll
                .filter
                .states
                .iter()
                .map(|s| s.name().to_ascii_lowercase().replace('_', "-"))
                .collect(),
            local_ports: Vec::new(),
            remote_ports: Vec::new(),
            include_loopback: poll.filter.include_loopback,
            proc_root: poll.proc_root,
        }
    }
}

impl Default for TrackerSection {
    fn default() -> Self {
        let tracker = TrackerConfig::default();
        let (continue_every, continue_interval) = match tracker.cadence {
            ContinueCadence::EveryCycles(n) => (n, None),
            ContinueCadence::Interval(d) => (0, Some(format_duration(d))),
        };
        Self {
            continue_every,
            continue_interval,
            grace_cycles: tracker.grace_cycles,
        }
    }
}

impl Default for ClassifierSection {
    fn default() -> Self {
        let unclassified = ClassifierConfig::default().default_activity;
        let label = unclassified.unwrap_or_default();
        Self {
            track_unclassified: unclassified.is_some(),
            default_experiment_id: label.experiment_id,
            default_activity_id: label.activity_id,
            rules: Vec::new(),
        }
    }
}

impl Default for ResolverSection {
    fn default() -> Self {
        let resolver = flowd_discovery::ResolverConfig::default();
        Self {
            ipv4: resolver.v4_target.is_some(),
            ipv6: resolver.v6_target.is_some(),
            v4_target: flowd_discovery::DEFAULT_V4_TARGET.to_string(),
            v6_target: flowd_discovery::DEFAULT_V6_TARGET.to_string(),
            hop_limit: resolver.hop_limit,
            stun: resolver.stun_enabled,
            stun_servers: resolver.stun_servers,
            stun_timeout: format_duration(resolver.stun_timeout),
            refresh_interval: format_duration(resolver.refresh_interval),
            public_validity: format_duration(resolver.public_validity),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            backends: transport.backends,
            send_timeout: format_duration(transport.send_timeout),
            collector: transport.firefly.collector,
            port: transport.firefly.port,
            hostname: transport.firefly.hostname,
            send_buffer_size: transport.firefly.send_buffer_size,
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        let health = HealthConfig::default();
        Self {
            degraded_after: health.degraded_after,
            critical_after: health.critical_after,
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or unknown keys.
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load `path`, falling back to defaults when it is the default location
    /// and does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file is missing, or any file
    /// cannot be parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() && path == Path::new(DEFAULT_CONFIG_PATH) {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Serialize back to TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Convert into a validated [`NodeConfig`]
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending key for unparseable values, or
    /// the first problem found by [`NodeConfig::validate`].
    pub fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let node = NodeConfig {
            poll: self.poll.to_poll_config()?,
            tracker: self.tracker.to_tracker_config()?,
            classifier: self.classifier.to_classifier_config()?,
            resolver: self.resolver.to_resolver_config()?,
            transport: self.transport.to_transport_config()?,
            health: HealthConfig {
                degraded_after: self.health.degraded_after,
                critical_after: self.health.critical_after,
            },
            shutdown_grace: parse_duration("daemon.shutdown_grace", &self.daemon.shutdown_grace)?,
            paths: PathsConfig {
                work_dir: self.daemon.work_dir.clone(),
                pid_file: self.daemon.pid_file.clone(),
            },
        };
        node.validate()?;
        Ok(node)
    }
}

impl PollSection {
    fn to_poll_config(&self) -> anyhow::Result<PollConfig> {
        let mut config = PollConfig {
            interval: parse_duration("poll.interval", &self.interval)?,
            timeout: parse_duration("poll.timeout", &self.timeout)?,
            proc_root: self.proc_root.clone(),
            ..PollConfig::default()
        };
        config.filter.protocols = parse_list("poll.protocols", &self.protocols)?;
        config.filter.states = parse_list::<ConnState>("poll.states", &self.states)?;
        config.filter.local_ports = parse_list("poll.local_ports", &self.local_ports)?;
        config.filter.remote_ports = parse_list("poll.remote_ports", &self.remote_ports)?;
        config.filter.include_loopback = self.include_loopback;
        Ok(config)
    }
}

impl TrackerSection {
    fn to_tracker_config(&self) -> anyhow::Result<TrackerConfig> {
        let cadence = match &self.continue_interval {
            Some(interval) => {
                ContinueCadence::Interval(parse_duration("tracker.continue_interval", interval)?)
            }
            None => ContinueCadence::EveryCycles(self.continue_every),
        };
        Ok(TrackerConfig {
            cadence,
            grace_cycles: self.grace_cycles,
        })
    }
}

impl ClassifierSection {
    fn to_classifier_config(&self) -> anyhow::Result<ClassifierConfig> {
        let rules = self
            .rules
            .iter()
            .map(RuleSection::to_rule)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ClassifierConfig {
            rules,
            default_activity: self.track_unclassified.then(|| {
                ActivityId::new(self.default_experiment_id, self.default_activity_id)
            }),
        })
    }
}

impl RuleSection {
    fn to_rule(&self) -> anyhow::Result<ClassificationRule> {
        let key = |field: &str| format!("classifier.rules[{}].{field}", self.name);
        let protocol = self
            .protocol
            .as_deref()
            .map(|p| p.parse::<Protocol>().map_err(|e| anyhow!("{}: {e}", key("protocol"))))
            .transpose()?;
        Ok(ClassificationRule {
            name: self.name.clone(),
            protocol,
            local_ports: parse_list::<PortRange>(&key("local_ports"), &self.local_ports)?,
            remote_ports: parse_list::<PortRange>(&key("remote_ports"), &self.remote_ports)?,
            activity: ActivityId::new(self.experiment_id, self.activity_id),
        })
    }
}

impl ResolverSection {
    fn to_resolver_config(&self) -> anyhow::Result<flowd_discovery::ResolverConfig> {
        let target = |enabled: bool, name: &str, value: &str| -> anyhow::Result<Option<SocketAddr>> {
            if !enabled {
                return Ok(None);
            }
            value
                .parse()
                .map(Some)
                .map_err(|e| anyhow!("resolver.{name}: invalid address '{value}': {e}"))
        };
        Ok(flowd_discovery::ResolverConfig {
            v4_target: target(self.ipv4, "v4_target", &self.v4_target)?,
            v6_target: target(self.ipv6, "v6_target", &self.v6_target)?,
            hop_limit: self.hop_limit,
            stun_enabled: self.stun,
            stun_servers: self.stun_servers.clone(),
            stun_timeout: parse_duration("resolver.stun_timeout", &self.stun_timeout)?,
            refresh_interval: parse_duration("resolver.refresh_interval", &self.refresh_interval)?,
            public_validity: parse_duration("resolver.public_validity", &self.public_validity)?,
        })
    }
}

impl TransportSection {
    fn to_transport_config(&self) -> anyhow::Result<TransportConfig> {
        Ok(TransportConfig {
            backends: self.backends.clone(),
            firefly: FireflyConfig {
                collector: self.collector.clone(),
                port: self.port,
                hostname: self.hostname.clone(),
                send_buffer_size: self.send_buffer_size,
            },
            send_timeout: parse_duration("transport.send_timeout", &self.send_timeout)?,
        })
    }
}

fn parse_duration(key: &str, value: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("{key}: invalid duration '{value}'"))
}

fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

fn parse_list<T>(key: &str, values: &[String]) -> anyhow::Result<Vec<T>>
where
    T: std::str::FromStr<Err = String>,
{
    values
        .iter()
        .map(|v| v.parse::<T>().map_err(|e| anyhow!("{key}: {e}")))
        .collect()
}
