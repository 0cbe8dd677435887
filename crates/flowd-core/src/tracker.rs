//! Flow lifecycle tracker.
//!
//! Diffs successive [`Snapshot`]s against the set of known flows and drives
//! each flow through its lifecycle:
//!
//! ```text
//!            first seen                 missing              still missing
//!   ABSENT ─────────────▶ ACTIVE ───────────────▶ CLOSING ──────────────────▶ ABSENT
//!            (START)        │  ▲                    │      (END, after grace)
//!                           │  └────────────────────┘
//!                           │      seen again (no event)
//!                           └── seen again: CONTINUE at the configured cadence
//! ```
//!
//! The tracker is synchronous and owns its flow table outright. It is driven
//! by exactly one pipeline task, so no locking is involved. Emission
//! failures downstream never feed back into it.

use crate::classify::Classifier;
use crate::event::{EventKind, LifecycleEvent};
use crate::flow::{FlowKey, FlowRecord, FlowState};
use crate::identity::ResolvedIdentity;
use crate::netstat::Snapshot;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// How often an active flow emits CONTINUE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueCadence {
    /// On every observation whose count is a multiple of N (START is
    /// observation 1). Zero is rejected by configuration validation and
    /// treated as 1 here.
    EveryCycles(u32),
    /// When at least this much wall-clock time passed since the flow's last
    /// emitted event
    Interval(Duration),
}

impl Default for ContinueCadence {
    fn default() -> Self {
        Self::EveryCycles(6)
    }
}

/// Tracker configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// CONTINUE cadence
    pub cadence: ContinueCadence,
    /// Snapshots a flow may be missing from before it is ended. With the
    /// default of 1 a flow missing once is held in CLOSING and ended on the
    /// second consecutive miss.
    pub grace_cycles: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cadence: ContinueCadence::default(),
            grace_cycles: 1,
        }
    }
}

/// Cumulative tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Snapshots processed
    pub cycles: u64,
    /// START events emitted
    pub started: u64,
    /// CONTINUE events emitted
    pub continued: u64,
    /// END events emitted
    pub ended: u64,
    /// Flows that reappeared while CLOSING
    pub gaps_absorbed: u64,
    /// Observations skipped because no activity label applied
    pub unclassified: u64,
}

/// Per-flow lifecycle state machine over successive snapshots
#[derive(Debug)]
pub struct FlowTracker {
    config: TrackerConfig,
    classifier: Classifier,
    flows: HashMap<FlowKey, FlowRecord>,
    stats: TrackerStats,
}

impl FlowTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new(config: TrackerConfig, classifier: Classifier) -> Self {
        Self {
            config,
            classifier,
            flows: HashMap::new(),
            stats: TrackerStats::default(),
        }
    }

    /// Apply one snapshot and return the events it produced.
    ///
    /// START and CONTINUE events come first, in snapshot order, followed by
    /// END events ordered by flow key. Duplicate keys within one snapshot
    /// count once.
    pub fn observe(
        &mut self,
        snapshot: &Snapshot,
        identity: &Arc<ResolvedIdentity>,
        now: SystemTime,
    ) -> Vec<LifecycleEvent> {
        self.stats.cycles += 1;
        let mut events = Vec::new();
        let mut present = HashSet::with_capacity(snapshot.len());

        for entry in snapshot.iter() {
            let key = entry.key;
            if !present.insert(key) {
                continue;
            }

            if let Some(record) = self.flows.get_mut(&key) {
                if let FlowState::Closing { missed } = record.state {
                    tracing::debug!(flow = %key, missed, "flow reappeared within grace window");
                    self.stats.gaps_absorbed += 1;
                }
                record.state = FlowState::Active;
                record.last_seen = now;
                record.observations += 1;

                if continue_due(self.config.cadence, record, now) {
                    events.push(emit(key, record, EventKind::Continue, identity, now));
                    self.stats.continued += 1;
                }
                continue;
            }

            let Some(activity) = self.classifier.classify(&key) else {
                self.stats.unclassified += 1;
                continue;
            };

            let mut record = FlowRecord::new(activity, now);
            events.push(emit(key, &mut record, EventKind::Start, identity, now));
            self.stats.started += 1;
            tracing::debug!(flow = %key, %activity, "flow started");
            self.flows.insert(key, record);
        }

        let grace = self.config.grace_cycles;
        let mut ended = Vec::new();
        for (key, record) in &mut self.flows {
            if present.contains(key) {
                continue;
            }
            let missed = match record.state {
                FlowState::Active => 1,
                FlowState::Closing { missed } => missed + 1,
            };
            if missed > grace {
                ended.push(*key);
            } else {
                record.state = FlowState::Closing { missed };
            }
        }

        ended.sort_unstable();
        for key in ended {
            if let Some(mut record) = self.flows.remove(&key) {
                events.push(emit(key, &mut record, EventKind::End, identity, now));
                self.stats.ended += 1;
                tracing::debug!(flow = %key, "flow ended");
            }
        }

        events
    }

    /// End every tracked flow, leaving the tracker empty.
    ///
    /// Used on shutdown so no flow disappears without an END.
    pub fn drain(
        &mut self,
        identity: &Arc<ResolvedIdentity>,
        now: SystemTime,
    ) -> Vec<LifecycleEvent> {
        let mut flows: Vec<_> = self.flows.drain().collect();
        flows.sort_unstable_by_key(|(key, _)| *key);
        self.stats.ended += flows.len() as u64;
        flows
            .into_iter()
            .map(|(key, mut record)| emit(key, &mut record, EventKind::End, identity, now))
            .collect()
    }

    /// Number of tracked flows (ACTIVE or CLOSING)
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether no flows are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Tracked record for `key`
    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<&FlowRecord> {
        self.flows.get(key)
    }

    /// Whether `key` is tracked
    #[must_use]
    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    /// Cumulative counters
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
}

fn continue_due(cadence: ContinueCadence, record: &FlowRecord, now: SystemTime) -> bool {
    match cadence {
        ContinueCadence::EveryCycles(n) => record.observations % u64::from(n.max(1)) == 0,
        ContinueCadence::Interval(interval) => {
            now.duration_since(record.last_emitted)
                .unwrap_or(Duration::ZERO)
                >= interval
        }
    }
}

fn emit(
    key: FlowKey,
    record: &mut FlowRecord,
    kind: EventKind,
    identity: &Arc<ResolvedIdentity>,
    now: SystemTime,
) -> LifecycleEvent {
    record.last_emitted = now;
    LifecycleEvent {
        key,
        kind,
        timestamp: now,
        flow_start: record.first_seen,
        sequence: record.take_sequence(),
        activity: record.activity,
        identity: Arc::clone(identity),
    }
}
