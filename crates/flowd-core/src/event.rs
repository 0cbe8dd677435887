//! Lifecycle events produced by the tracker.

use crate::classify::ActivityId;
use crate::flow::FlowKey;
use crate::identity::ResolvedIdentity;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Kind of lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Flow observed for the first time
    Start,
    /// Flow still active (periodic)
    Continue,
    /// Flow gone for longer than the grace window
    End,
}

impl EventKind {
    /// Firefly `flow-lifecycle.state` value
    #[must_use]
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Continue => "ongoing",
            Self::End => "end",
        }
    }

    /// Parse a firefly `flow-lifecycle.state` value
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "ongoing" => Some(Self::Continue),
            "end" => Some(Self::End),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("START"),
            Self::Continue => f.write_str("CONTINUE"),
            Self::End => f.write_str("END"),
        }
    }
}

/// One lifecycle transition, ready to be dispatched
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// Flow the event refers to
    pub key: FlowKey,
    /// Transition kind
    pub kind: EventKind,
    /// When the transition was observed
    pub timestamp: SystemTime,
    /// When the flow was first observed
    pub flow_start: SystemTime,
    /// Per-flow sequence number, 0 for START
    pub sequence: u64,
    /// Activity label assigned at START
    pub activity: ActivityId,
    /// Source identity at the time of the event
    pub identity: Arc<ResolvedIdentity>,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} {} [{}]",
            self.kind, self.sequence, self.key, self.activity
        )
    }
}
