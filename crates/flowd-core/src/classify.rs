//! Activity classification.
//!
//! Every tracked flow carries an [`ActivityId`]: the experiment and activity
//! it belongs to. The label is chosen once, when the flow is first seen, by
//! matching the flow key against an ordered list of rules. The first matching
//! rule wins; if none match, the configured default applies. Flows with no
//! label at all are not tracked.

use crate::flow::{FlowKey, Protocol};
use std::fmt;
use std::ops::RangeInclusive;

/// Experiment and activity label of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActivityId {
    /// Experiment (community) identifier
    pub experiment_id: u32,
    /// Activity identifier within the experiment
    pub activity_id: u32,
}

impl ActivityId {
    /// Label used when flows are tracked without a matching rule
    pub const UNCLASSIFIED: Self = Self {
        experiment_id: 0,
        activity_id: 0,
    };

    /// Create a new activity label
    #[must_use]
    pub const fn new(experiment_id: u32, activity_id: u32) -> Self {
        Self {
            experiment_id,
            activity_id,
        }
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.experiment_id, self.activity_id)
    }
}

/// Inclusive port range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange(RangeInclusive<u16>);

impl PortRange {
    /// Range covering `start..=end`
    #[must_use]
    pub fn new(start: u16, end: u16) -> Self {
        Self(start..=end)
    }

    /// Range covering a single port
    #[must_use]
    pub fn single(port: u16) -> Self {
        Self(port..=port)
    }

    /// Whether `port` lies in the range
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }

    /// First port of the range
    #[must_use]
    pub fn start(&self) -> u16 {
        *self.0.start()
    }

    /// Last port of the range
    #[must_use]
    pub fn end(&self) -> u16 {
        *self.0.end()
    }
}

impl std::str::FromStr for PortRange {
    type Err = String;

    /// Parse `"443"` or `"5000-5100"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{p}' in range '{s}'"))
        };
        match s.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("empty port range '{s}'"));
                }
                Ok(Self::new(start, end))
            }
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start() == self.end() {
            write!(f, "{}", self.start())
        } else {
            write!(f, "{}-{}", self.start(), self.end())
        }
    }
}

/// Whether `port` falls in any of `ranges`; an empty list matches everything
#[must_use]
pub fn port_matches(ranges: &[PortRange], port: u16) -> bool {
    ranges.is_empty() || ranges.iter().any(|r| r.contains(port))
}

/// A single classification rule
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    /// Rule name, for logs
    pub name: String,
    /// Restrict to one protocol
    pub protocol: Option<Protocol>,
    /// Local port ranges; empty matches any
    pub local_ports: Vec<PortRange>,
    /// Remote port ranges; empty matches any
    pub remote_ports: Vec<PortRange>,
    /// Label assigned on match
    pub activity: ActivityId,
}

impl ClassificationRule {
    /// Whether the rule matches `key`
    #[must_use]
    pub fn matches(&self, key: &FlowKey) -> bool {
        self.protocol.is_none_or(|p| p == key.protocol)
            && port_matches(&self.local_ports, key.local.port())
            && port_matches(&self.remote_ports, key.remote.port())
    }
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Ordered rules, first match wins
    pub rules: Vec<ClassificationRule>,
    /// Label for flows no rule matches; `None` leaves them untracked
    pub default_activity: Option<ActivityId>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_activity: Some(ActivityId::UNCLASSIFIED),
        }
    }
}

/// Assigns activity labels to new flows
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    /// Create a classifier from configuration
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Label for `key`, or `None` if the flow should not be tracked
    #[must_use]
    pub fn classify(&self, key: &FlowKey) -> Option<ActivityId> {
        match self.config.rules.iter().find(|rule| rule.matches(key)) {
            Some(rule) => {
                tracing::trace!(flow = %key, rule = %rule.name, "classified flow");
                Some(rule.activity)
            }
            None => self.config.default_activity,
        }
    }

    /// Number of configured rules
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.config.rules.len()
    }
}
