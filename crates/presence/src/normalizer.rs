//! Presence normalizer
//!
//! Vendor modules are sloppy about slot notifications: a token swapped
//! quickly is often reported as a second insertion, and some modules repeat
//! notifications for unchanged slots. Downstream consumers want a strictly
//! alternating present/absent stream per slot, so the normalizer repairs the
//! raw stream by inserting synthetic transitions where one was skipped.

use crate::generator::RawSlotEvent;
use common::{QueueReceiver, QueueSender, unbounded_queue};
use model::{NormalizedEvent, PresenceSnapshot, SlotId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-slot presence memory
///
/// Pure state machine used by [`PresenceNormalizer::run`]; one tracker lives
/// for exactly one driver session.
///
/// # Example
///
/// ```
/// use presence::normalizer::PresenceTracker;
/// use model::{PresenceSnapshot, SlotId};
///
/// let mut tracker = PresenceTracker::new();
/// tracker.observe(SlotId(1), PresenceSnapshot::present("Reader", "A"));
///
/// // A second insertion without a removal in between
/// let events = tracker.observe(SlotId(1), PresenceSnapshot::present("Reader", "B"));
/// assert_eq!(events.len(), 2);
/// assert!(events[0].synthetic && !events[0].is_present());
/// assert!(!events[1].synthetic && events[1].is_present());
/// ```
#[derive(Debug, Default)]
pub struct PresenceTracker {
    last: HashMap<SlotId, PresenceSnapshot>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw notification and return the repaired events in order
    ///
    /// The last element is always the real event; at most one synthetic
    /// event precedes it.
    pub fn observe(&mut self, slot: SlotId, snapshot: PresenceSnapshot) -> Vec<NormalizedEvent> {
        let mut out = Vec::with_capacity(2);
        self.process(slot, snapshot, false, &mut out);
        out
    }

    fn process(
        &mut self,
        slot: SlotId,
        snapshot: PresenceSnapshot,
        synthetic: bool,
        out: &mut Vec<NormalizedEvent>,
    ) {
        let repair = match self.last.get(&slot) {
            Some(prev) if prev.present == snapshot.present => Some(if prev.present {
                prev.with_presence(false)
            } else {
                snapshot.with_presence(true)
            }),
            _ => None,
        };

        if let Some(fill) = repair {
            trace!("Repairing skipped transition on {}", slot);
            self.process(slot, fill, true, out);
        }

        self.last.insert(slot, snapshot.clone());
        out.push(NormalizedEvent {
            slot,
            snapshot,
            synthetic,
        });
    }

    /// Last snapshot recorded for `slot`
    pub fn last(&self, slot: SlotId) -> Option<&PresenceSnapshot> {
        self.last.get(&slot)
    }
}

/// Stream of normalized events for one subscriber
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: QueueReceiver<NormalizedEvent>,
}

impl Subscription {
    /// Next event; `None` once the normalizer is gone
    pub async fn recv(&self) -> Option<NormalizedEvent> {
        self.rx.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<NormalizedEvent> {
        self.rx.try_recv().ok().flatten()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
    }
}

/// Long-lived fan-out of normalized events
///
/// Every subscriber gets its own unbounded queue, so a slow subscriber never
/// holds up the consumer loop or other subscribers.
#[derive(Debug, Clone, Default)]
pub struct PresenceNormalizer {
    subscribers: Arc<Mutex<Vec<QueueSender<NormalizedEvent>>>>,
}

impl PresenceNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every normalized event published from now on
    ///
    /// Tokens already present when a session starts are not replayed; use
    /// [`DeviceRegistry::current`](crate::DeviceRegistry::current) for those.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded_queue();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription { rx }
    }

    /// Invoke `callback` for every event on a runtime task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_fn<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(NormalizedEvent) + Send + 'static,
    {
        let subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        })
    }

    /// Number of live subscribers as of the last publish
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every subscriber, pruning dropped ones
    pub fn publish(&self, event: &NormalizedEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.push(event.clone()).is_ok());
    }

    /// Consume raw events of one session until cancelled
    ///
    /// Starts from an empty tracker: slot identities are only stable while
    /// the driver stays initialized.
    pub async fn run(&self, queue: QueueReceiver<RawSlotEvent>, cancel: CancellationToken) {
        let mut tracker = PresenceTracker::new();
        debug!("Presence normalizer started");

        loop {
            let raw = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                raw = queue.recv() => raw,
            };

            let Ok((slot, snapshot)) = raw else {
                debug!("Raw slot event queue closed");
                break;
            };

            for event in tracker.observe(slot, snapshot) {
                debug!("{}", event);
                self.publish(&event);
            }
        }

        // Unblocks a generator still pushing into this session's queue
        queue.close();
        debug!("Presence normalizer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        create_absent_snapshot, create_present_snapshot, event_shape, slot,
    };

    #[test]
    fn test_first_observation_passes_through() {
        let mut tracker = PresenceTracker::new();
        let events = tracker.observe(slot(1), create_present_snapshot(1));
        assert_eq!(event_shape(&events), vec![(1, true, false)]);

        let mut tracker = PresenceTracker::new();
        let events = tracker.observe(slot(1), create_absent_snapshot(1));
        assert_eq!(event_shape(&events), vec![(1, false, false)]);
    }

    #[test]
    fn test_swap_synthesizes_removal_of_previous_token() {
        let mut tracker = PresenceTracker::new();
        tracker.observe(slot(3), create_present_snapshot(1));
        let events = tracker.observe(slot(3), create_present_snapshot(2));

        assert_eq!(event_shape(&events), vec![(3, false, true), (3, true, false)]);
        // The synthetic removal describes the token that left
        assert_eq!(events[0].snapshot.serial.as_deref(), Some("SN000001"));
        assert_eq!(events[1].snapshot.serial.as_deref(), Some("SN000002"));
    }

    #[test]
    fn test_repeated_removal_synthesizes_insertion() {
        let mut tracker = PresenceTracker::new();
        tracker.observe(slot(2), create_absent_snapshot(2));
        let events = tracker.observe(slot(2), create_absent_snapshot(2));

        assert_eq!(event_shape(&events), vec![(2, true, true), (2, false, false)]);
        assert_eq!(
            events[0].snapshot.description,
            create_absent_snapshot(2).description
        );
    }

    #[test]
    fn test_slots_are_independent() {
        let mut tracker = PresenceTracker::new();
        tracker.observe(slot(1), create_present_snapshot(1));
        let events = tracker.observe(slot(2), create_present_snapshot(2));
        assert_eq!(event_shape(&events), vec![(2, true, false)]);
        assert!(tracker.last(slot(1)).is_some_and(|s| s.present));
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let normalizer = PresenceNormalizer::new();
        let kept = normalizer.subscribe();
        let dropped = normalizer.subscribe();
        assert_eq!(normalizer.subscriber_count(), 2);

        drop(dropped);
        let event = NormalizedEvent::real(slot(1), create_present_snapshot(1));
        normalizer.publish(&event);

        assert_eq!(normalizer.subscriber_count(), 1);
        assert_eq!(kept.try_recv(), Some(event));
    }

    #[tokio::test]
    async fn test_run_publishes_until_cancelled() {
        let normalizer = PresenceNormalizer::new();
        let subscription = normalizer.subscribe();
        let (tx, rx) = unbounded_queue();
        let cancel = CancellationToken::new();

        let task = {
            let normalizer = normalizer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { normalizer.run(rx, cancel).await })
        };

        tx.push((slot(0), create_present_snapshot(1))).unwrap();
        tx.push((slot(0), create_present_snapshot(2))).unwrap();

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(subscription.recv().await.unwrap());
        }
        assert_eq!(
            event_shape(&events),
            vec![(0, true, false), (0, false, true), (0, true, false)]
        );

        cancel.cancel();
        task.await.unwrap();
        assert!(tx.is_closed());
    }
}
