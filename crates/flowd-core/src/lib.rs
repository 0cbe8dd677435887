//! # flowd Core
//!
//! Flow lifecycle engine for the flowd daemon.
//!
//! This crate provides:
//! - Flow identity and per-flow state ([`FlowKey`], [`FlowRecord`])
//! - Connection enumeration from the kernel tables ([`ProcNetPoller`])
//! - Activity classification rules ([`Classifier`])
//! - The lifecycle state machine ([`FlowTracker`])
//! - The firefly datagram codec ([`FireflyEncoder`], [`FireflyMessage`])
//! - Error types and handling
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Snapshot  ┌──────────────┐  LifecycleEvent  ┌──────────────┐
//! │   Poller     │ ─────────▶ │   Tracker    │ ───────────────▶ │  Backends    │
//! │ (/proc/net)  │            │ (state mach.)│                  │ (firefly...) │
//! └──────────────┘            └──────▲───────┘                  └──────▲───────┘
//!                                    │     Arc<ResolvedIdentity>       │
//!                                    └──────────── Resolver ───────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod error;
pub mod event;
pub mod firefly;
pub mod flow;
pub mod identity;
pub mod netstat;
pub mod tracker;

pub use classify::{ActivityId, ClassificationRule, Classifier, ClassifierConfig, PortRange};
pub use error::{FireflyError, PollError};
pub use event::{EventKind, LifecycleEvent};
pub use firefly::{FireflyEncoder, FireflyMessage};
pub use flow::{FlowKey, FlowRecord, FlowState, Protocol};
pub use identity::{FamilyIdentity, ResolvedIdentity};
pub use netstat::{ConnState, ConnectionPoller, PollFilter, ProcNetPoller, Snapshot, SnapshotEntry};
pub use tracker::{ContinueCadence, FlowTracker, TrackerConfig, TrackerStats};

/// Firefly message format version
pub const FIREFLY_VERSION: u32 = 1;

/// Default collector UDP port for firefly datagrams
pub const DEFAULT_FIREFLY_PORT: u16 = 10514;
