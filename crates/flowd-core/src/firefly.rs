//! Firefly message codec.
//!
//! A firefly is a single UDP datagram carrying a syslog (RFC 5424) header
//! followed by a JSON body describing one flow lifecycle transition:
//!
//! ```text
//! <134>1 2024-05-01T12:00:00.000000+00:00 host.example flowd - firefly-json - {...}
//! ```
//!
//! Priority 134 is facility local0, severity informational.

use crate::FIREFLY_VERSION;
use crate::error::FireflyError;
use crate::event::{EventKind, LifecycleEvent};
use crate::flow::FlowKey;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::SystemTime;

/// Syslog priority: local0.info
pub const SYSLOG_PRIORITY: u8 = 134;

/// Syslog MSGID identifying firefly payloads
pub const FIREFLY_MSGID: &str = "firefly-json";

/// Syslog APP-NAME
pub const APP_NAME: &str = "flowd";

/// Largest payload that fits in a single IPv4 UDP datagram
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Decoded firefly JSON body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FireflyMessage {
    /// Firefly format version
    pub version: u32,
    /// Lifecycle section
    pub flow_lifecycle: FlowLifecycle,
    /// Flow identity section
    pub flow_id: FlowId,
    /// Scientific context section
    pub context: Context,
    /// Emitting host identity
    #[serde(default)]
    pub source: Source,
}

/// `flow-lifecycle` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlowLifecycle {
    /// `start`, `ongoing` or `end`
    pub state: String,
    /// Time of this transition
    pub current_time: String,
    /// Time the flow was first observed
    pub start_time: String,
    /// Time the flow ended, END only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Per-flow sequence number
    pub sequence: u64,
}

/// `flow-id` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlowId {
    /// `ipv4` or `ipv6`
    pub afi: String,
    /// Local address
    pub src_ip: IpAddr,
    /// Remote address
    pub dst_ip: IpAddr,
    /// `tcp` or `udp`
    pub protocol: String,
    /// Local port
    pub src_port: u16,
    /// Remote port
    pub dst_port: u16,
}

/// `context` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Context {
    /// Experiment identifier
    pub experiment_id: u32,
    /// Activity identifier
    pub activity_id: u32,
    /// Emitting application and version
    pub application: String,
}

/// `source` section; unknown fields are omitted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Source {
    /// OS-selected local address for the flow's family
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<IpAddr>,
    /// NAT-mapped public address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<IpAddr>,
    /// NAT-mapped public port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
}

impl FireflyMessage {
    /// Build the JSON body for `event`
    #[must_use]
    pub fn from_event(event: &LifecycleEvent, application: &str) -> Self {
        let family = event.identity.for_addr(&event.key.local.ip());
        let current_time = rfc3339(event.timestamp);

        Self {
            version: FIREFLY_VERSION,
            flow_lifecycle: FlowLifecycle {
                state: event.kind.as_wire().to_string(),
                start_time: rfc3339(event.flow_start),
                end_time: (event.kind == EventKind::End).then(|| current_time.clone()),
                current_time,
                sequence: event.sequence,
            },
            flow_id: flow_id(&event.key),
            context: Context {
                experiment_id: event.activity.experiment_id,
                activity_id: event.activity.activity_id,
                application: application.to_string(),
            },
            source: Source {
                local_ip: family.local,
                public_ip: family.public.map(|addr| addr.ip()),
                public_port: family.public.map(|addr| addr.port()),
            },
        }
    }

    /// Lifecycle kind, if the state string is known
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_wire(&self.flow_lifecycle.state)
    }

    /// Decode a syslog-framed firefly datagram
    pub fn decode(datagram: &[u8]) -> Result<Self, FireflyError> {
        let text = std::str::from_utf8(datagram).map_err(|_| FireflyError::Utf8)?;
        let rest = text
            .strip_prefix('<')
            .ok_or(FireflyError::Envelope("missing priority"))?;
        let (priority, rest) = rest
            .split_once('>')
            .ok_or(FireflyError::Envelope("unterminated priority"))?;
        priority
            .parse::<u8>()
            .map_err(|_| FireflyError::Envelope("invalid priority"))?;

        // VERSION TIMESTAMP HOSTNAME APP-NAME PROCID MSGID SD MSG
        let parts: Vec<&str> = rest.splitn(8, ' ').collect();
        let [_version, _ts, _host, _app, _procid, msgid, _sd, body] = parts[..] else {
            return Err(FireflyError::Envelope("truncated syslog header"));
        };
        if msgid != FIREFLY_MSGID {
            return Err(FireflyError::Envelope("not a firefly message"));
        }

        Ok(serde_json::from_str(body)?)
    }
}

fn flow_id(key: &FlowKey) -> FlowId {
    FlowId {
        afi: if key.is_ipv6() { "ipv6" } else { "ipv4" }.to_string(),
        src_ip: key.local.ip(),
        dst_ip: key.remote.ip(),
        protocol: key.protocol.as_str().to_string(),
        src_port: key.local.port(),
        dst_port: key.remote.port(),
    }
}

/// RFC 3339 timestamp with microseconds and a numeric UTC offset
#[must_use]
pub fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Encodes lifecycle events as firefly datagrams
#[derive(Debug, Clone)]
pub struct FireflyEncoder {
    hostname: String,
    application: String,
}

impl FireflyEncoder {
    /// Encoder stamping `hostname` into the syslog header
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            application: format!("{APP_NAME} {}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Override the `context.application` value
    #[must_use]
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    /// Hostname used in the syslog header
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Encode `event` into one datagram
    pub fn encode(&self, event: &LifecycleEvent) -> Result<Vec<u8>, FireflyError> {
        let body = serde_json::to_string(&FireflyMessage::from_event(event, &self.application))?;
        let datagram = format!(
            "<{SYSLOG_PRIORITY}>1 {} {} {APP_NAME} - {FIREFLY_MSGID} - {body}",
            rfc3339(event.timestamp),
            self.hostname,
        );
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(FireflyError::TooLarge(datagram.len()));
        }
        Ok(datagram.into_bytes())
    }
}

/// Host name for syslog headers: kernel hostname, else `localhost`
#[must_use]
pub fn system_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
