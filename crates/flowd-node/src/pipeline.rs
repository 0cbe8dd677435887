//! Poll → track → dispatch cycle.
//!
//! The pipeline owns the flow tracker. One cycle polls the connection table
//! (bounded by the poll timeout), feeds the snapshot to the tracker stamped
//! with the latest resolved identity, and dispatches the resulting events. A
//! failed poll skips the tracker entirely so missing data is never mistaken
//! for closed flows.

use crate::health::HealthMonitor;
use flowd_core::{
    ConnectionPoller, EventKind, FlowTracker, LifecycleEvent, PollError, TrackerStats,
};
use flowd_discovery::IdentityHandle;
use flowd_transport::{DispatchReport, Dispatcher};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// What happened to the poll of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Snapshot taken and applied
    Observed {
        /// Connections in the snapshot
        connections: usize,
    },
    /// Poll failed or timed out; tracker untouched
    PollFailed(String),
    /// End-of-run flush of all tracked flows
    Flushed,
}

/// Summary of one cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cycle number, starting at 1
    pub cycle: u64,
    /// Poll result
    pub outcome: CycleOutcome,
    /// START events emitted
    pub started: usize,
    /// CONTINUE events emitted
    pub continued: usize,
    /// END events emitted
    pub ended: usize,
    /// Flows tracked after the cycle
    pub tracked: usize,
    /// Delivery results
    pub dispatch: DispatchReport,
    /// Wall time of the whole cycle
    pub elapsed: Duration,
}

impl CycleReport {
    /// Total lifecycle events of the cycle
    #[must_use]
    pub fn events(&self) -> usize {
        self.started + self.continued + self.ended
    }
}

/// Drives the poller, tracker and dispatcher
pub struct Pipeline {
    poller: Arc<dyn ConnectionPoller>,
    tracker: FlowTracker,
    dispatcher: Dispatcher,
    identity: IdentityHandle,
    health: HealthMonitor,
    poll_timeout: Duration,
    cycles: u64,
}

impl Pipeline {
    /// Assemble a pipeline
    #[must_use]
    pub fn new(
        poller: Arc<dyn ConnectionPoller>,
        tracker: FlowTracker,
        dispatcher: Dispatcher,
        identity: IdentityHandle,
        health: HealthMonitor,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            poller,
            tracker,
            dispatcher,
            identity,
            health,
            poll_timeout,
            cycles: 0,
        }
    }

    /// Tracker state, for inspection
    #[must_use]
    pub fn tracker(&self) -> &FlowTracker {
        &self.tracker
    }

    /// Run one poll → track → dispatch cycle
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let started_at = Instant::now();

        let polled = match tokio::time::timeout(self.poll_timeout, self.poller.poll()).await {
            Ok(result) => result,
            Err(_) => Err(PollError::Timeout(self.poll_timeout)),
        };

        let snapshot = match polled {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.health.record_failure().await;
                tracing::warn!(
                    cycle = self.cycles,
                    poller = self.poller.name(),
                    error = %e,
                    "poll failed, skipping cycle"
                );
                return self.report(
                    CycleOutcome::PollFailed(e.to_string()),
                    &[],
                    DispatchReport::default(),
                    started_at,
                );
            }
        };
        self.health.record_success().await;

        let identity = self.identity.current();
        let events = self
            .tracker
            .observe(&snapshot, &identity, SystemTime::now());
        let outcome = CycleOutcome::Observed {
            connections: snapshot.len(),
        };
        self.deliver(outcome, events, started_at).await
    }

    /// End every tracked flow and dispatch the END events
    pub async fn flush(&mut self) -> CycleReport {
        let started_at = Instant::now();
        let identity = self.identity.current();
        let events = self.tracker.drain(&identity, SystemTime::now());
        tracing::info!(flows = events.len(), "flushing tracked flows");
        self.deliver(CycleOutcome::Flushed, events, started_at).await
    }

    /// Run cycles every `interval` until `shutdown` flips to `true`, then
    /// flush and close the backends.
    ///
    /// A cycle in flight when shutdown arrives gets `grace` to finish before
    /// it is abandoned; the final flush gets another `grace`.
    pub async fn run(
        mut self,
        interval: Duration,
        grace: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> TrackerStats {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'cycles: loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break 'cycles,
                _ = ticker.tick() => {}
            }

            let cycle = self.run_cycle();
            tokio::pin!(cycle);
            tokio::select! {
                report = &mut cycle => log_cycle(&report),
                _ = wait_for_shutdown(&mut shutdown) => {
                    match tokio::time::timeout(grace, &mut cycle).await {
                        Ok(report) => log_cycle(&report),
                        Err(_) => tracing::warn!(?grace, "in-flight cycle abandoned"),
                    }
                    break 'cycles;
                }
            }
        }

        match tokio::time::timeout(grace, self.flush()).await {
            Ok(report) => log_cycle(&report),
            Err(_) => tracing::warn!(?grace, "shutdown flush abandoned"),
        }
        self.dispatcher.close().await;

        let stats = self.tracker.stats();
        tracing::info!(
            cycles = stats.cycles,
            started = stats.started,
            continued = stats.continued,
            ended = stats.ended,
            "pipeline stopped"
        );
        stats
    }

    async fn deliver(
        &mut self,
        outcome: CycleOutcome,
        events: Vec<LifecycleEvent>,
        started_at: Instant,
    ) -> CycleReport {
        for event in &events {
            tracing::debug!(
                kind = %event.kind,
                flow = %event.key,
                sequence = event.sequence,
                activity = %event.activity,
                "lifecycle event"
            );
        }
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        let dispatch = self.dispatcher.dispatch(events).await;
        self.report(outcome, &kinds, dispatch, started_at)
    }

    fn report(
        &self,
        outcome: CycleOutcome,
        kinds: &[EventKind],
        dispatch: DispatchReport,
        started_at: Instant,
    ) -> CycleReport {
        let count = |kind: EventKind| kinds.iter().filter(|k| **k == kind).count();
        CycleReport {
            cycle: self.cycles,
            outcome,
            started: count(EventKind::Start),
            continued: count(EventKind::Continue),
            ended: count(EventKind::End),
            tracked: self.tracker.len(),
            dispatch,
            elapsed: started_at.elapsed(),
        }
    }
}

/// Resolves once `shutdown` is `true` or its sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // wait_for also returns immediately if the value is already true
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn log_cycle(report: &CycleReport) {
    if report.events() > 0 || report.dispatch.failures() > 0 {
        tracing::info!(
            cycle = report.cycle,
            started = report.started,
            continued = report.continued,
            ended = report.ended,
            tracked = report.tracked,
            failures = report.dispatch.failures(),
            elapsed = ?report.elapsed,
            "cycle complete"
        );
    } else {
        tracing::trace!(cycle = report.cycle, tracked = report.tracked, "cycle complete");
    }
}
