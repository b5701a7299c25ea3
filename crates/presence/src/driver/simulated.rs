//! Simulated token module
//!
//! Keeps a set of reader slots in memory and reports changes through the
//! same blocking calls a vendor module offers. Besides faithful insert and
//! remove notifications it can reproduce the misbehaviour the normalizer has
//! to cope with: swaps reported without the intermediate removal, duplicate
//! notifications, spurious empty wake-ups and transient wait errors.

use super::TokenDriver;
use model::{DriverError, DriverResult, PresenceSnapshot, SlotId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

/// Number of calls made against the driver, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCalls {
    pub initialize: u32,
    pub finalize: u32,
    pub list: u32,
    pub wait: u32,
}

/// Outcome queued for the next `wait_for_slot_event`
#[derive(Debug)]
enum WaitOutcome {
    Event(SlotId, PresenceSnapshot),
    Empty,
    Error(DriverError),
}

#[derive(Debug, Default)]
struct SimState {
    initialized: bool,
    /// Bumped on finalize so blocked waiters notice the module went away
    epoch: u64,
    slots: BTreeMap<SlotId, PresenceSnapshot>,
    pending: VecDeque<WaitOutcome>,
    calls: DriverCalls,
    /// Lifecycle calls in the order they were issued
    history: Vec<&'static str>,
    initialize_failures: VecDeque<DriverError>,
    finalize_failures: VecDeque<DriverError>,
}

/// In-memory token module
///
/// # Example
///
/// ```
/// use presence::driver::{SimulatedDriver, TokenDriver};
/// use model::{PresenceSnapshot, SlotId};
///
/// let driver = SimulatedDriver::new(2);
/// driver.initialize().unwrap();
///
/// driver.insert(SlotId(1), PresenceSnapshot::present("Reader 1", "0042"));
/// let (slot, snapshot) = driver.wait_for_slot_event().unwrap().unwrap();
///
/// assert_eq!(slot, SlotId(1));
/// assert!(snapshot.present);
/// assert_eq!(driver.list_present_slots().unwrap(), vec![SlotId(1)]);
/// ```
#[derive(Debug)]
pub struct SimulatedDriver {
    state: Mutex<SimState>,
    changed: Condvar,
    poll_timeout: Option<Duration>,
}

impl SimulatedDriver {
    /// Create a module with `slot_count` empty reader slots numbered from 0
    pub fn new(slot_count: u64) -> Self {
        let slots = (0..slot_count)
            .map(|id| {
                (
                    SlotId(id),
                    PresenceSnapshot::absent(format!("Simulated Reader {}", id)),
                )
            })
            .collect();

        Self {
            state: Mutex::new(SimState {
                slots,
                ..SimState::default()
            }),
            changed: Condvar::new(),
            poll_timeout: None,
        }
    }

    /// Make `wait_for_slot_event` return `Ok(None)` after `timeout` without
    /// events, like modules that only support polling
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, state: &mut SimState, outcome: WaitOutcome) {
        // A module that is not initialized does not buffer notifications
        if state.initialized {
            state.pending.push_back(outcome);
            self.changed.notify_all();
        }
    }

    /// Put a token into a slot and report it
    pub fn insert(&self, slot: SlotId, snapshot: PresenceSnapshot) {
        let snapshot = snapshot.with_presence(true);
        let mut state = self.lock();
        state.slots.insert(slot, snapshot.clone());
        self.enqueue(&mut state, WaitOutcome::Event(slot, snapshot));
    }

    /// Pull the token out of a slot and report it
    ///
    /// The removal notification keeps the slot description but drops the
    /// token serial, like most modules do once the token is gone.
    pub fn remove(&self, slot: SlotId) {
        let mut state = self.lock();
        let snapshot = match state.slots.get(&slot) {
            Some(current) => PresenceSnapshot {
                serial: None,
                ..current.with_presence(false)
            },
            None => PresenceSnapshot::absent(format!("Simulated Reader {}", slot.0)),
        };
        state.slots.insert(slot, snapshot.clone());
        self.enqueue(&mut state, WaitOutcome::Event(slot, snapshot));
    }

    /// Replace the token in a slot faster than the module can notice the
    /// removal: only the new insertion is reported
    pub fn swap(&self, slot: SlotId, snapshot: PresenceSnapshot) {
        self.insert(slot, snapshot);
    }

    /// Report the current state of a slot again without any physical change
    pub fn repeat_last(&self, slot: SlotId) {
        let mut state = self.lock();
        if let Some(snapshot) = state.slots.get(&slot).cloned() {
            self.enqueue(&mut state, WaitOutcome::Event(slot, snapshot));
        }
    }

    /// Queue a raw notification verbatim, updating the slot state to match
    pub fn report(&self, slot: SlotId, snapshot: PresenceSnapshot) {
        let mut state = self.lock();
        state.slots.insert(slot, snapshot.clone());
        self.enqueue(&mut state, WaitOutcome::Event(slot, snapshot));
    }

    /// Make the next wait return without an event
    pub fn inject_empty(&self) {
        let mut state = self.lock();
        self.enqueue(&mut state, WaitOutcome::Empty);
    }

    /// Make the next wait fail with `error`
    pub fn inject_wait_error(&self, error: DriverError) {
        let mut state = self.lock();
        self.enqueue(&mut state, WaitOutcome::Error(error));
    }

    /// Make the next `initialize` call fail with `error`
    pub fn fail_next_initialize(&self, error: DriverError) {
        self.lock().initialize_failures.push_back(error);
    }

    /// Make the next `finalize` call fail with `error`
    pub fn fail_next_finalize(&self, error: DriverError) {
        self.lock().finalize_failures.push_back(error);
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn calls(&self) -> DriverCalls {
        self.lock().calls
    }

    /// `"initialize"` / `"finalize"` in call order
    pub fn lifecycle_history(&self) -> Vec<&'static str> {
        self.lock().history.clone()
    }

    /// All slot identities known to the module
    pub fn slot_ids(&self) -> Vec<SlotId> {
        self.lock().slots.keys().copied().collect()
    }

    /// Whether a token currently sits in `slot`
    pub fn is_present(&self, slot: SlotId) -> bool {
        self.lock().slots.get(&slot).is_some_and(|s| s.present)
    }

    /// Notifications not yet picked up by a waiter
    pub fn pending_events(&self) -> usize {
        self.lock().pending.len()
    }
}

impl TokenDriver for SimulatedDriver {
    fn initialize(&self) -> DriverResult<()> {
        let mut state = self.lock();
        state.calls.initialize += 1;
        state.history.push("initialize");

        if let Some(error) = state.initialize_failures.pop_front() {
            debug!("Simulated initialize failure: {}", error);
            return Err(error);
        }
        if state.initialized {
            return Err(DriverError::AlreadyInitialized);
        }

        state.initialized = true;
        state.pending.clear();
        debug!("Simulated module initialized ({} slots)", state.slots.len());
        Ok(())
    }

    fn finalize(&self) -> DriverResult<()> {
        let mut state = self.lock();
        state.calls.finalize += 1;
        state.history.push("finalize");

        if let Some(error) = state.finalize_failures.pop_front() {
            debug!("Simulated finalize failure: {}", error);
            return Err(error);
        }
        if !state.initialized {
            return Err(DriverError::NotInitialized);
        }

        state.initialized = false;
        state.epoch += 1;
        state.pending.clear();
        self.changed.notify_all();
        debug!("Simulated module finalized");
        Ok(())
    }

    fn list_present_slots(&self) -> DriverResult<Vec<SlotId>> {
        let mut state = self.lock();
        state.calls.list += 1;
        if !state.initialized {
            return Err(DriverError::NotInitialized);
        }

        Ok(state
            .slots
            .iter()
            .filter(|(_, snapshot)| snapshot.present)
            .map(|(slot, _)| *slot)
            .collect())
    }

    fn slot_snapshot(&self, slot: SlotId) -> DriverResult<PresenceSnapshot> {
        let state = self.lock();
        if !state.initialized {
            return Err(DriverError::NotInitialized);
        }
        state
            .slots
            .get(&slot)
            .cloned()
            .ok_or(DriverError::SlotNotFound(slot))
    }

    fn wait_for_slot_event(&self) -> DriverResult<Option<(SlotId, PresenceSnapshot)>> {
        let mut state = self.lock();
        state.calls.wait += 1;
        if !state.initialized {
            return Err(DriverError::NotInitialized);
        }
        let epoch = state.epoch;

        loop {
            if state.epoch != epoch || !state.initialized {
                return Err(DriverError::NotInitialized);
            }

            if let Some(outcome) = state.pending.pop_front() {
                trace!("Simulated wait returning {:?}", outcome);
                return match outcome {
                    WaitOutcome::Event(slot, snapshot) => Ok(Some((slot, snapshot))),
                    WaitOutcome::Empty => Ok(None),
                    WaitOutcome::Error(error) => Err(error),
                };
            }

            match self.poll_timeout {
                Some(timeout) => {
                    let (guard, result) = self
                        .changed
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    if result.timed_out() && state.pending.is_empty() && state.epoch == epoch {
                        return Ok(None);
                    }
                }
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}
