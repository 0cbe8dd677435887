//! Flow identity and tracked flow state.

use crate::classify::ActivityId;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// TCP connection
    Tcp,
    /// Connected UDP socket
    Udp,
}

impl Protocol {
    /// Lowercase protocol name as used on the wire
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// Immutable identity of a flow: protocol plus local and remote endpoints.
///
/// Two observations with equal keys are the same flow. A new connection that
/// reuses an identical tuple while the old one is still within its grace
/// window is indistinguishable from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    /// Transport protocol
    pub protocol: Protocol,
    /// Local endpoint
    pub local: SocketAddr,
    /// Remote endpoint
    pub remote: SocketAddr,
}

impl FlowKey {
    /// Create a new flow key
    #[must_use]
    pub fn new(protocol: Protocol, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            protocol,
            local,
            remote,
        }
    }

    /// Shorthand for a TCP flow key
    #[must_use]
    pub fn tcp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(Protocol::Tcp, local, remote)
    }

    /// Shorthand for a UDP flow key
    #[must_use]
    pub fn udp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(Protocol::Udp, local, remote)
    }

    /// Whether the flow runs over IPv6
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        matches!(self.local.ip(), IpAddr::V6(_))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.local, self.remote)
    }
}

/// Lifecycle state of a tracked flow
///
/// `Absent` is represented by the record not existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Seen in the most recent snapshot
    Active,
    /// Missing from recent snapshots, END pending unless it reappears
    Closing {
        /// Consecutive snapshots the flow has been missing from
        missed: u32,
    },
}

/// Tracked state for one [`FlowKey`]
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub(crate) state: FlowState,
    pub(crate) first_seen: SystemTime,
    pub(crate) last_seen: SystemTime,
    pub(crate) last_emitted: SystemTime,
    pub(crate) activity: ActivityId,
    pub(crate) next_sequence: u64,
    pub(crate) observations: u64,
}

impl FlowRecord {
    pub(crate) fn new(activity: ActivityId, now: SystemTime) -> Self {
        Self {
            state: FlowState::Active,
            first_seen: now,
            last_seen: now,
            last_emitted: now,
            activity,
            next_sequence: 0,
            observations: 1,
        }
    }

    /// Take the next sequence number for an emitted event
    pub(crate) fn take_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Time of the first observation
    #[must_use]
    pub fn first_seen(&self) -> SystemTime {
        self.first_seen
    }

    /// Time of the latest observation
    #[must_use]
    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    /// Activity assigned at creation
    #[must_use]
    pub fn activity(&self) -> ActivityId {
        self.activity
    }

    /// Number of snapshots the flow has been present in
    #[must_use]
    pub fn observations(&self) -> u64 {
        self.observations
    }

    /// Sequence number the next emitted event will carry
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse_and_display() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
    }

    #[test]
    fn test_flow_key_display() {
        let key = FlowKey::tcp(
            "10.0.0.5:5001".parse().unwrap(),
            "198.51.100.9:443".parse().unwrap(),
        );
        assert_eq!(key.to_string(), "tcp 10.0.0.5:5001 -> 198.51.100.9:443");
        assert!(!key.is_ipv6());
    }

    #[test]
    fn test_flow_key_identity() {
        let a = FlowKey::tcp(
            "10.0.0.5:5001".parse().unwrap(),
            "198.51.100.9:443".parse().unwrap(),
        );
        let b = FlowKey::udp(a.local, a.remote);
        assert_ne!(a, b);
        assert_eq!(a, FlowKey::tcp(a.local, a.remote));
    }

    #[test]
    fn test_record_sequence() {
        let mut record = FlowRecord::new(ActivityId::UNCLASSIFIED, SystemTime::now());
        assert_eq!(record.take_sequence(), 0);
        assert_eq!(record.take_sequence(), 1);
        assert_eq!(record.next_sequence(), 2);
        assert_eq!(record.observations(), 1);
    }
}
