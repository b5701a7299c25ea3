//! Registry of attached tokens
//!
//! Tracks the devices currently present according to the normalized event
//! stream and offers [`DeviceRegistry::first_available`], which resolves as
//! soon as any token is attached. All callers waiting at the same time share
//! one pending waiter; it is created and resolved under the registry mutex so
//! an insertion can never slip between "registry is empty" and "waiter is
//! installed".

use crate::driver::TokenDriver;
use crate::lifecycle::LifecycleListener;
use crate::normalizer::PresenceNormalizer;
use crate::session::DriverSession;
use common::Error;
use futures::FutureExt;
use futures::future::Shared;
use model::{DeviceHandle, NormalizedEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type SharedWaiter = Shared<oneshot::Receiver<DeviceHandle>>;

struct PendingWaiter {
    tx: oneshot::Sender<DeviceHandle>,
    shared: SharedWaiter,
}

impl PendingWaiter {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx,
            shared: rx.shared(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// Attached devices, oldest first, at most one per slot
    devices: Vec<DeviceHandle>,
    waiter: Option<PendingWaiter>,
    /// Token of the session currently feeding the registry
    session: Option<CancellationToken>,
}

impl RegistryState {
    fn apply(&mut self, event: &NormalizedEvent) {
        if event.is_present() {
            let handle = DeviceHandle::new(event.slot, event.snapshot.clone());
            match self.devices.iter_mut().find(|d| d.slot() == event.slot) {
                Some(existing) => *existing = handle.clone(),
                None => self.devices.push(handle.clone()),
            }
            info!("Token attached: {}", handle);

            if let Some(waiter) = self.waiter.take() {
                debug!("Resolving pending waiter with {}", handle);
                let _ = waiter.tx.send(handle);
            }
        } else if let Some(index) = self.devices.iter().position(|d| d.slot() == event.slot) {
            let handle = self.devices.remove(index);
            info!("Token detached: {}", handle);
        }
    }
}

/// Set of attached devices
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<RegistryState>>,
    normalizer: PresenceNormalizer,
}

impl DeviceRegistry {
    /// Create a registry fed by `normalizer` once a session starts
    pub fn new(normalizer: PresenceNormalizer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState::default())),
            normalizer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one normalized event
    pub fn apply(&self, event: &NormalizedEvent) {
        self.lock().apply(event);
    }

    /// Apply an event unless the session that produced it has ended
    fn apply_for_session(&self, event: &NormalizedEvent, session: &CancellationToken) {
        let mut state = self.lock();
        if session.is_cancelled() {
            debug!("Dropping event from ended session: {}", event);
            return;
        }
        state.apply(event);
    }

    /// Any attached device, waiting for one if none is attached
    ///
    /// Returns the oldest attached device immediately if there is one.
    /// Otherwise resolves with the next device to attach, or fails with
    /// [`Error::Cancelled`] if the driver is finalized first.
    pub async fn first_available(&self) -> common::Result<DeviceHandle> {
        let waiter = {
            let mut state = self.lock();
            if let Some(device) = state.devices.first() {
                return Ok(device.clone());
            }
            state
                .waiter
                .get_or_insert_with(PendingWaiter::new)
                .shared
                .clone()
        };

        waiter.await.map_err(|_| Error::Cancelled)
    }

    /// Snapshot of the attached devices, oldest first
    pub fn current(&self) -> Vec<DeviceHandle> {
        self.lock().devices.clone()
    }

    pub fn find_by_serial(&self, serial: &str) -> Option<DeviceHandle> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.serial() == Some(serial))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    pub fn has_pending_waiter(&self) -> bool {
        self.lock().waiter.is_some()
    }

    /// Fail the pending waiter, if any, with [`Error::Cancelled`]
    pub fn cancel_waiter(&self) {
        if self.lock().waiter.take().is_some() {
            debug!("Pending waiter cancelled");
        }
    }

    /// Load the tokens already present when the driver comes up
    ///
    /// Seeded devices go straight into the registry and are not published
    /// through the normalizer, so subscribers never see them. The tracker
    /// starts each session empty, so replacing a seeded token later shows up
    /// as a bare insertion with no repaired removal before it.
    pub fn seed(&self, driver: &dyn TokenDriver) -> common::Result<usize> {
        let slots = driver.list_present_slots()?;
        let mut seeded = 0;
        for slot in slots {
            let snapshot = driver.slot_snapshot(slot)?;
            if snapshot.present {
                self.apply(&NormalizedEvent::real(slot, snapshot));
                seeded += 1;
            }
        }
        Ok(seeded)
    }
}

impl LifecycleListener for DeviceRegistry {
    fn post_init(&self, session: &DriverSession) -> common::Result<()> {
        // Subscribe before seeding so no insertion falls in between
        let subscription = self.normalizer.subscribe();
        let token = session.cancellation().child_token();
        self.lock().session = Some(token.clone());

        let registry = self.clone();
        session.spawn("device-registry", async move {
            while let Some(event) = subscription.recv().await {
                registry.apply_for_session(&event, &token);
            }
        });

        // A failed seed leaves the event feed running
        let seeded = self.seed(session.driver().as_ref())?;
        debug!(
            "Seeded {} token(s) for session {}",
            seeded,
            session.generation()
        );
        Ok(())
    }

    fn pre_finalize(&self, session: &DriverSession) -> common::Result<()> {
        let mut state = self.lock();
        if let Some(token) = state.session.take() {
            token.cancel();
        }
        if state.waiter.take().is_some() {
            debug!("Cancelling pending waiter");
        }
        let detached = state.devices.len();
        state.devices.clear();
        debug!(
            "Registry cleared ({} token(s)) for session {}",
            detached,
            session.generation()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "device-registry"
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DeviceRegistry")
            .field("devices", &state.devices)
            .field("waiting", &state.waiter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, create_absent_snapshot, create_present_snapshot, slot, with_timeout,
    };

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(PresenceNormalizer::new())
    }

    fn attach(registry: &DeviceRegistry, id: u32) {
        registry.apply(&NormalizedEvent::real(
            slot(id as u64),
            create_present_snapshot(id),
        ));
    }

    fn detach(registry: &DeviceRegistry, id: u32) {
        registry.apply(&NormalizedEvent::real(
            slot(id as u64),
            create_absent_snapshot(id),
        ));
    }

    #[test]
    fn test_insertion_order_and_removal() {
        let registry = registry();
        attach(&registry, 2);
        attach(&registry, 1);
        attach(&registry, 3);

        let slots: Vec<_> = registry.current().iter().map(|d| d.slot().0).collect();
        assert_eq!(slots, vec![2, 1, 3]);

        detach(&registry, 1);
        let slots: Vec<_> = registry.current().iter().map(|d| d.slot().0).collect();
        assert_eq!(slots, vec![2, 3]);

        // Removing an unknown slot is a no-op
        detach(&registry, 9);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_one_handle_per_slot() {
        let registry = registry();
        attach(&registry, 1);
        registry.apply(&NormalizedEvent::real(slot(1), create_present_snapshot(5)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.current()[0].serial(), Some("SN000005"));
    }

    #[test]
    fn test_find_by_serial() {
        let registry = registry();
        attach(&registry, 1);
        attach(&registry, 2);

        let found = registry.find_by_serial("SN000002").unwrap();
        assert_eq!(found.slot(), slot(2));
        assert!(registry.find_by_serial("SN000003").is_none());
    }

    #[tokio::test]
    async fn test_first_available_immediate() {
        let registry = registry();
        attach(&registry, 4);
        attach(&registry, 1);

        let device = registry.first_available().await.unwrap();
        assert_eq!(device.slot(), slot(4));
        assert!(!registry.has_pending_waiter());
    }

    #[tokio::test]
    async fn test_waiter_resolved_by_attach() {
        let registry = registry();
        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.first_available().await })
        };

        assert!(
            common::test_utils::wait_until(DEFAULT_TEST_TIMEOUT, || registry.has_pending_waiter())
                .await
        );
        attach(&registry, 7);

        let device = with_timeout(DEFAULT_TEST_TIMEOUT, pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(device.serial(), Some("SN000007"));
        assert!(!registry.has_pending_waiter());
    }

    #[tokio::test]
    async fn test_cancel_waiter() {
        let registry = registry();
        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.first_available().await })
        };

        assert!(
            common::test_utils::wait_until(DEFAULT_TEST_TIMEOUT, || registry.has_pending_waiter())
                .await
        );
        registry.cancel_waiter();

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
