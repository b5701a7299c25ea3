//! Property tests for presence normalization
//!
//! Feeds arbitrary raw notification sequences (duplicates, skipped
//! removals, interleaved slots) through the tracker and checks the shape of
//! the repaired stream.
//!
//! Run with: `cargo test -p presence --test normalizer_properties`

use common::test_utils::{create_absent_snapshot, create_present_snapshot, event_shape, slot};
use model::{NormalizedEvent, PresenceSnapshot, SlotId};
use presence::PresenceTracker;
use proptest::prelude::*;
use std::collections::HashMap;

/// One raw notification: slot, presence, token id
fn raw_event_strategy() -> impl Strategy<Value = (u64, bool, u32)> {
    (0u64..4, any::<bool>(), 0u32..3)
}

fn raw_snapshot(present: bool, token: u32) -> PresenceSnapshot {
    if present {
        create_present_snapshot(token)
    } else {
        create_absent_snapshot(token)
    }
}

fn normalize(raw: &[(u64, bool, u32)]) -> Vec<NormalizedEvent> {
    let mut tracker = PresenceTracker::new();
    raw.iter()
        .flat_map(|&(id, present, token)| tracker.observe(slot(id), raw_snapshot(present, token)))
        .collect()
}

proptest! {
    /// Property: every slot's stream strictly alternates after the first event
    #[test]
    fn prop_per_slot_alternation(raw in proptest::collection::vec(raw_event_strategy(), 0..64)) {
        let events = normalize(&raw);
        let mut last: HashMap<SlotId, bool> = HashMap::new();

        for event in &events {
            if let Some(previous) = last.insert(event.slot, event.is_present()) {
                prop_assert_ne!(previous, event.is_present(), "repeated state on {}", event.slot);
            }
        }
    }

    /// Property: real events are passed through unchanged and in order
    #[test]
    fn prop_real_events_preserved(raw in proptest::collection::vec(raw_event_strategy(), 0..64)) {
        let events = normalize(&raw);
        let real: Vec<_> = events.iter().filter(|e| !e.synthetic).collect();

        prop_assert_eq!(real.len(), raw.len());
        for (event, &(id, present, token)) in real.iter().zip(&raw) {
            prop_assert_eq!(event.slot, slot(id));
            prop_assert_eq!(&event.snapshot, &raw_snapshot(present, token));
        }
    }

    /// Property: at most one synthetic event, and only directly before a real one
    #[test]
    fn prop_single_synthetic_insertion(raw in proptest::collection::vec(raw_event_strategy(), 0..64)) {
        let mut tracker = PresenceTracker::new();

        for &(id, present, token) in &raw {
            let emitted = tracker.observe(slot(id), raw_snapshot(present, token));
            prop_assert!(!emitted.is_empty() && emitted.len() <= 2);

            let real = emitted.last().unwrap();
            prop_assert!(!real.synthetic);
            if emitted.len() == 2 {
                prop_assert!(emitted[0].synthetic);
                prop_assert_eq!(emitted[0].slot, real.slot);
                prop_assert_ne!(emitted[0].is_present(), real.is_present());
            }
        }
    }

    /// Property: synthetic events appear exactly for repeated states
    #[test]
    fn prop_synthetic_count(raw in proptest::collection::vec(raw_event_strategy(), 0..64)) {
        let mut last: HashMap<u64, bool> = HashMap::new();
        let repeats = raw
            .iter()
            .filter(|&&(id, present, _)| last.insert(id, present) == Some(present))
            .count();

        let synthetic = normalize(&raw).iter().filter(|e| e.synthetic).count();
        prop_assert_eq!(synthetic, repeats);
    }
}

#[test]
fn test_double_insertion_scenario() {
    let v1 = create_present_snapshot(1);
    let v2 = create_present_snapshot(2);

    let mut tracker = PresenceTracker::new();
    tracker.observe(slot(0), v1.clone());
    let events = tracker.observe(slot(0), v2.clone());

    assert_eq!(
        events,
        vec![
            NormalizedEvent::synthetic(slot(0), v1.with_presence(false)),
            NormalizedEvent::real(slot(0), v2),
        ]
    );
}

#[test]
fn test_well_formed_stream_needs_no_repair() {
    let raw = [(0, true, 1), (1, true, 2), (0, false, 1), (0, true, 2), (1, false, 2)];
    let events = normalize(&raw);

    assert_eq!(
        event_shape(&events),
        vec![
            (0, true, false),
            (1, true, false),
            (0, false, false),
            (0, true, false),
            (1, false, false),
        ]
    );
}

#[test]
fn test_absent_seed_then_alternating_reports() {
    let events = normalize(&[(0, false, 0), (0, true, 1), (0, false, 1), (0, true, 2)]);
    assert!(events.iter().all(|e| !e.synthetic));
    assert_eq!(events.len(), 4);
}

#[test]
fn test_duplicate_notification_is_bracketed() {
    let events = normalize(&[(2, true, 1), (2, true, 1)]);
    assert_eq!(
        event_shape(&events),
        vec![(2, true, false), (2, false, true), (2, true, false)]
    );
}
