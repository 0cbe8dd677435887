//! Connection enumeration.
//!
//! A [`ConnectionPoller`] produces one [`Snapshot`] of the connections of
//! interest per call. The Linux implementation reads the kernel tables under
//! `/proc/net`, which list one socket per line:
//!
//! ```text
//!   sl  local_address rem_address   st tx_queue rx_queue ...
//!    0: 0500000A:1389 096433C6:01BB 01 00000000:00000000 ...
//! ```
//!
//! Addresses are the raw in-kernel words printed in hex (host byte order per
//! 32-bit group), ports are printed in network order.

use crate::classify::{PortRange, port_matches};
use crate::error::PollError;
use crate::flow::{FlowKey, Protocol};
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::SystemTime;

/// Raw socket state as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// `TCP_ESTABLISHED` (also reported for connected UDP sockets)
    Established,
    /// `TCP_SYN_SENT`
    SynSent,
    /// `TCP_SYN_RECV`
    SynRecv,
    /// `TCP_FIN_WAIT1`
    FinWait1,
    /// `TCP_FIN_WAIT2`
    FinWait2,
    /// `TCP_TIME_WAIT`
    TimeWait,
    /// `TCP_CLOSE` (also unconnected UDP sockets)
    Close,
    /// `TCP_CLOSE_WAIT`
    CloseWait,
    /// `TCP_LAST_ACK`
    LastAck,
    /// `TCP_LISTEN`
    Listen,
    /// `TCP_CLOSING`
    Closing,
    /// Any other kernel state code
    Unknown(u8),
}

impl ConnState {
    /// Map a kernel state code
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Established,
            0x02 => Self::SynSent,
            0x03 => Self::SynRecv,
            0x04 => Self::FinWait1,
            0x05 => Self::FinWait2,
            0x06 => Self::TimeWait,
            0x07 => Self::Close,
            0x08 => Self::CloseWait,
            0x09 => Self::LastAck,
            0x0A => Self::Listen,
            0x0B => Self::Closing,
            other => Self::Unknown(other),
        }
    }

    /// Conventional upper-case state name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Established => "ESTABLISHED",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::Listen => "LISTEN",
            Self::Closing => "CLOSING",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ConnState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase().replace('-', "_");
        (0x01..=0x0B)
            .map(Self::from_code)
            .find(|state| state.name() == upper)
            .ok_or_else(|| format!("unknown connection state '{s}'"))
    }
}

/// One connection in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Flow identity
    pub key: FlowKey,
    /// Raw socket state
    pub state: ConnState,
}

/// Connections observed in one poll cycle
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: Vec<SnapshotEntry>,
    taken_at: SystemTime,
}

impl Snapshot {
    /// Snapshot of `entries`, taken now
    #[must_use]
    pub fn new(entries: Vec<SnapshotEntry>) -> Self {
        Self {
            entries,
            taken_at: SystemTime::now(),
        }
    }

    /// Snapshot with no connections
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Snapshot of established connections with the given keys
    pub fn from_keys(keys: impl IntoIterator<Item = FlowKey>) -> Self {
        Self::new(
            keys.into_iter()
                .map(|key| SnapshotEntry {
                    key,
                    state: ConnState::Established,
                })
                .collect(),
        )
    }

    /// Entries in enumeration order
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.iter()
    }

    /// Flow keys in enumeration order
    pub fn keys(&self) -> impl Iterator<Item = FlowKey> + '_ {
        self.entries.iter().map(|e| e.key)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When the snapshot was taken
    #[must_use]
    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }
}

/// Source of connection snapshots
#[async_trait]
pub trait ConnectionPoller: Send + Sync {
    /// Enumerate the connections of interest
    async fn poll(&self) -> Result<Snapshot, PollError>;

    /// Poller name, for logs
    fn name(&self) -> &'static str;
}

/// Which connections a poller reports
#[derive(Debug, Clone)]
pub struct PollFilter {
    /// Protocols to enumerate
    pub protocols: Vec<Protocol>,
    /// Accepted raw states
    pub states: Vec<ConnState>,
    /// Local port ranges of interest; empty matches any
    pub local_ports: Vec<PortRange>,
    /// Remote port ranges of interest; empty matches any
    pub remote_ports: Vec<PortRange>,
    /// Report connections with a loopback endpoint
    pub include_loopback: bool,
}

impl Default for PollFilter {
    fn default() -> Self {
        Self {
            protocols: vec![Protocol::Tcp, Protocol::Udp],
            states: vec![ConnState::Established],
            local_ports: Vec::new(),
            remote_ports: Vec::new(),
            include_loopback: false,
        }
    }
}

impl PollFilter {
    /// Whether `key` in `state` passes the filter
    #[must_use]
    pub fn accepts(&self, key: &FlowKey, state: ConnState) -> bool {
        if key.remote.port() == 0 || key.remote.ip().is_unspecified() {
            return false;
        }
        if state == ConnState::Listen {
            return false;
        }
        if !self.include_loopback && (key.local.ip().is_loopback() || key.remote.ip().is_loopback())
        {
            return false;
        }
        self.protocols.contains(&key.protocol)
            && self.states.contains(&state)
            && port_matches(&self.local_ports, key.local.port())
            && port_matches(&self.remote_ports, key.remote.port())
    }
}

/// Poller backed by the `/proc/net` connection tables
#[derive(Debug, Clone)]
pub struct ProcNetPoller {
    proc_root: PathBuf,
    filter: PollFilter,
}

impl ProcNetPoller {
    /// Poller reading from the live `/proc`
    #[must_use]
    pub fn new(filter: PollFilter) -> Self {
        Self::with_root("/proc", filter)
    }

    /// Poller reading from an alternative proc root
    pub fn with_root(proc_root: impl Into<PathBuf>, filter: PollFilter) -> Self {
        Self {
            proc_root: proc_root.into(),
            filter,
        }
    }

    /// Active filter
    #[must_use]
    pub fn filter(&self) -> &PollFilter {
        &self.filter
    }

    fn tables(&self) -> impl Iterator<Item = (Protocol, &'static str)> + '_ {
        [
            (Protocol::Tcp, "tcp"),
            (Protocol::Tcp, "tcp6"),
            (Protocol::Udp, "udp"),
            (Protocol::Udp, "udp6"),
        ]
        .into_iter()
        .filter(|(protocol, _)| self.filter.protocols.contains(protocol))
    }
}

#[async_trait]
impl ConnectionPoller for ProcNetPoller {
    async fn poll(&self) -> Result<Snapshot, PollError> {
        let mut entries = Vec::new();

        for (protocol, table) in self.tables() {
            let path = self.proc_root.join("net").join(table);
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                // hosts with IPv6 disabled have no v6 tables
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && table.ends_with('6') => {
                    tracing::debug!(table = %path.display(), "table not present, skipping");
                    continue;
                }
                Err(source) => {
                    return Err(PollError::Table {
                        table: path.display().to_string(),
                        source,
                    });
                }
            };

            entries.extend(
                parse_table(protocol, &contents)
                    .filter(|e| self.filter.accepts(&e.key, e.state)),
            );
        }

        Ok(Snapshot::new(entries))
    }

    fn name(&self) -> &'static str {
        "procfs"
    }
}

/// Parse the contents of one `/proc/net/{tcp,tcp6,udp,udp6}` table.
///
/// The header line and malformed lines are skipped; no filtering happens
/// here.
pub fn parse_table(protocol: Protocol, contents: &str) -> impl Iterator<Item = SnapshotEntry> + '_ {
    contents
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(move |line| match parse_line(protocol, line) {
            Some(entry) => Some(entry),
            None => {
                tracing::debug!(%protocol, line = line.trim(), "skipping malformed table line");
                None
            }
        })
}

fn parse_line(protocol: Protocol, line: &str) -> Option<SnapshotEntry> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = parse_endpoint(fields.next()?)?;
    let remote = parse_endpoint(fields.next()?)?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;

    Some(SnapshotEntry {
        key: FlowKey::new(protocol, local, remote),
        state: ConnState::from_code(state),
    })
}

/// Parse `ADDR:PORT` in `/proc/net` hex notation
fn parse_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(parse_word(addr)?)),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&parse_word(addr.get(i * 8..i * 8 + 8)?)?);
            }
            let v6 = Ipv6Addr::from(octets);
            match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            }
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// One 32-bit group, printed by the kernel from host-order memory
fn parse_word(hex: &str) -> Option<[u8; 4]> {
    u32::from_str_radix(hex, 16).ok().map(u32::to_ne_bytes)
}
