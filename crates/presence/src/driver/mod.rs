//! Token driver boundary
//!
//! The native module is an external collaborator. This module only describes
//! the blocking calls the presence core issues against it, plus a simulated
//! implementation used by tests and by the daemon when no hardware is around.
//!
//! Every method blocks the calling thread. The lifecycle controller and the
//! event generator call them from dedicated OS threads, never from Tokio
//! worker threads.

pub mod simulated;

use model::{DriverResult, PresenceSnapshot, SlotId};
use std::sync::Arc;

pub use simulated::{DriverCalls, SimulatedDriver};

/// Blocking interface of a cryptographic token module
pub trait TokenDriver: Send + Sync + 'static {
    /// Load and initialize the module
    fn initialize(&self) -> DriverResult<()>;

    /// Release the module; blocked `wait_for_slot_event` calls should return
    fn finalize(&self) -> DriverResult<()>;

    /// Slots that currently hold a token
    fn list_present_slots(&self) -> DriverResult<Vec<SlotId>>;

    /// Current descriptive state of a slot
    fn slot_snapshot(&self, slot: SlotId) -> DriverResult<PresenceSnapshot>;

    /// Block until the module reports the next slot event
    ///
    /// `Ok(None)` means the wait ended without an event (for example a
    /// polling timeout) and should simply be reissued.
    fn wait_for_slot_event(&self) -> DriverResult<Option<(SlotId, PresenceSnapshot)>>;
}

/// Driver shared between the controller, the session and the generator
pub type SharedDriver = Arc<dyn TokenDriver>;
