//! Property-based tests for flowd
//!
//! Uses proptest to verify tracker invariants across random snapshot
//! sequences, and decoder robustness against arbitrary input.

use proptest::prelude::*;

// ============================================================================
// Tracker Lifecycle Properties
// ============================================================================

mod tracker_properties {
    use super::*;
    use flowd_core::{
        Classifier, ContinueCadence, EventKind, FlowKey, FlowTracker, LifecycleEvent,
        ResolvedIdentity, Snapshot, TrackerConfig,
    };
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    /// Universe of flows a random snapshot draws from
    fn universe() -> Vec<FlowKey> {
        (0..6u16)
            .map(|i| {
                FlowKey::tcp(
                    format!("10.0.0.5:{}", 5000 + i).parse().unwrap(),
                    format!("198.51.100.{}:443", 1 + i % 3).parse().unwrap(),
                )
            })
            .collect()
    }

    /// Each cycle is a bitmask over the universe
    fn cycles() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(0u8..64, 1..40)
    }

    fn run(masks: &[u8], every: u32, grace: u32) -> (FlowTracker, Vec<Vec<LifecycleEvent>>) {
        let keys = universe();
        let mut tracker = FlowTracker::new(
            TrackerConfig {
                cadence: ContinueCadence::EveryCycles(every),
                grace_cycles: grace,
            },
            Classifier::default(),
        );
        let identity = Arc::new(ResolvedIdentity::default());
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let per_cycle = masks
            .iter()
            .enumerate()
            .map(|(i, mask)| {
                let snapshot = Snapshot::from_keys(
                    keys.iter()
                        .enumerate()
                        .filter(|(bit, _)| mask & (1 << bit) != 0)
                        .map(|(_, key)| *key),
                );
                tracker.observe(&snapshot, &identity, start + Duration::from_secs(i as u64))
            })
            .collect();
        (tracker, per_cycle)
    }

    proptest! {
        /// Per flow lifetime: one START at seq 0, strictly increasing
        /// sequences, at most one END and nothing after it until a new START.
        #[test]
        fn lifecycle_well_formed(masks in cycles(), every in 1u32..5, grace in 0u32..3) {
            let (tracker, per_cycle) = run(&masks, every, grace);
            let mut open: HashMap<FlowKey, u64> = HashMap::new();

            for event in per_cycle.iter().flatten() {
                match event.kind {
                    EventKind::Start => {
                        prop_assert!(!open.contains_key(&event.key), "duplicate START");
                        prop_assert_eq!(event.sequence, 0);
                        open.insert(event.key, 0);
                    }
                    EventKind::Continue | EventKind::End => {
                        let last = open.get(&event.key).copied();
                        prop_assert!(last.is_some(), "event before START");
                        prop_assert_eq!(event.sequence, last.unwrap() + 1);
                        if event.kind == EventKind::End {
                            open.remove(&event.key);
                        } else {
                            open.insert(event.key, event.sequence);
                        }
                    }
                }
            }

            prop_assert_eq!(open.len(), tracker.len());
            let stats = tracker.stats();
            prop_assert_eq!(stats.started - stats.ended, tracker.len() as u64);
            prop_assert_eq!(stats.cycles, masks.len() as u64);
        }

        /// END only after more than `grace` consecutive absent cycles.
        #[test]
        fn end_requires_grace(masks in cycles(), grace in 0u32..3) {
            let (_, per_cycle) = run(&masks, 1, grace);
            let keys = universe();

            for (cycle, events) in per_cycle.iter().enumerate() {
                for event in events.iter().filter(|e| e.kind == EventKind::End) {
                    let bit = keys.iter().position(|k| *k == event.key).unwrap();
                    let absent = masks[..=cycle]
                        .iter()
                        .rev()
                        .take_while(|mask| *mask & (1 << bit) == 0)
                        .count();
                    prop_assert_eq!(absent as u32, grace + 1);
                }
            }
        }

        /// A flow present every cycle gets exactly one CONTINUE per period.
        #[test]
        fn continue_cadence(len in 1usize..60, every in 1u32..8) {
            let masks = vec![0b1u8; len];
            let (_, per_cycle) = run(&masks, every, 1);
            let continues = per_cycle
                .iter()
                .flatten()
                .filter(|e| e.kind == EventKind::Continue)
                .count();
            // observation 1 is the START itself
            let expected = (2..=len).filter(|n| n % every as usize == 0).count();
            prop_assert_eq!(continues, expected);
            prop_assert_eq!(
                per_cycle.iter().flatten().filter(|e| e.kind == EventKind::Start).count(),
                1
            );
        }

        /// Draining ends every tracked flow, in key order.
        #[test]
        fn drain_ends_everything(masks in cycles()) {
            let (mut tracker, _) = run(&masks, 2, 1);
            let tracked = tracker.len();
            let ends = tracker.drain(&Arc::new(ResolvedIdentity::default()), SystemTime::now());

            prop_assert_eq!(ends.len(), tracked);
            prop_assert!(tracker.is_empty());
            prop_assert!(ends.iter().all(|e| e.kind == EventKind::End));
            prop_assert!(ends.windows(2).all(|w| w[0].key < w[1].key));
        }
    }
}

// ============================================================================
// Decoder Robustness Properties
// ============================================================================

mod decoder_properties {
    use super::*;
    use flowd_core::{
        ActivityId, EventKind, FireflyEncoder, FireflyMessage, FlowKey, LifecycleEvent, Protocol,
        ResolvedIdentity, netstat::parse_table,
    };
    use flowd_discovery::nat::StunMessage;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    proptest! {
        /// Arbitrary bytes never panic the STUN decoder.
        #[test]
        fn stun_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = StunMessage::decode(&bytes);
        }

        /// Arbitrary bytes never panic the firefly decoder.
        #[test]
        fn firefly_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = FireflyMessage::decode(&bytes);
        }

        /// Arbitrary table text never panics the /proc/net parser.
        #[test]
        fn proc_table_parse_never_panics(text in "\\PC{0,400}") {
            let _ = parse_table(Protocol::Tcp, &text).count();
        }

        /// Encoded fireflies fit one datagram and decode to the same flow.
        #[test]
        fn firefly_preserves_flow(
            local in any::<IpAddr>(),
            remote in any::<IpAddr>(),
            ports in (1u16..=u16::MAX, 1u16..=u16::MAX),
            sequence in any::<u64>(),
            end in any::<bool>(),
            label in (any::<u32>(), any::<u32>()),
        ) {
            let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_714_564_800);
            let event = LifecycleEvent {
                key: FlowKey::udp(SocketAddr::new(local, ports.0), SocketAddr::new(remote, ports.1)),
                kind: if end { EventKind::End } else { EventKind::Continue },
                timestamp: now,
                flow_start: now - Duration::from_secs(60),
                sequence,
                activity: ActivityId::new(label.0, label.1),
                identity: Arc::new(ResolvedIdentity::default()),
            };

            let datagram = FireflyEncoder::new("host.example").encode(&event).unwrap();
            let message = FireflyMessage::decode(&datagram).unwrap();
            prop_assert_eq!(message.kind(), Some(event.kind));
            prop_assert_eq!(message.flow_lifecycle.sequence, sequence);
            prop_assert_eq!(message.flow_lifecycle.end_time.is_some(), end);
            prop_assert_eq!(message.flow_id.src_ip, local);
            prop_assert_eq!(message.flow_id.dst_port, ports.1);
            prop_assert_eq!(message.context.activity_id, label.1);
        }
    }
}
