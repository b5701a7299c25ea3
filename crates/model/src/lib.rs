//! Data model for tokenwatch
//!
//! This crate defines the values exchanged between the token driver boundary,
//! the presence normalizer, the device registry and their consumers: slot
//! identities, presence snapshots, normalized events, device handles and the
//! driver lifecycle state.
//!
//! # Example
//!
//! ```
//! use model::{NormalizedEvent, PresenceSnapshot, SlotId};
//!
//! let snapshot = PresenceSnapshot::present("Reader 0", "0012AB34");
//! let event = NormalizedEvent::real(SlotId(0), snapshot);
//!
//! assert!(event.is_present());
//! assert!(!event.synthetic);
//! assert_eq!(event.snapshot.serial.as_deref(), Some("0012AB34"));
//! ```

pub mod error;
pub mod types;

pub use error::{DriverError, DriverResult};
pub use types::{
    DeviceHandle, LifecycleState, NormalizedEvent, PresenceSnapshot, SlotFlags, SlotId, Trigger,
    Version,
};
