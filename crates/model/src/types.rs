//! Slot, presence and lifecycle type definitions
//!
//! This module defines the values that flow from the driver boundary through
//! the presence normalizer to the device registry.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Physical slot identifier (driver-assigned)
///
/// Identifies a connector or reader position. The value is stable across
/// insert/remove cycles of the same physical slot and unique for as long as the
/// driver stays initialized; it must not be carried over to the next session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Hardware or firmware version as reported by the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

bitflags! {
    /// Capability flags of a slot and the token it holds
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SlotFlags: u32 {
        /// The reader supports removable devices
        const REMOVABLE = 1 << 0;
        /// The slot is a hardware slot rather than a software emulation
        const HARDWARE = 1 << 1;
        /// The token in the slot has been personalized
        const TOKEN_INITIALIZED = 1 << 2;
        /// The token requires a user login before private operations
        const LOGIN_REQUIRED = 1 << 3;
    }
}

/// State of one slot at a point in time
///
/// Produced by the driver, or synthesized by the presence normalizer when it
/// repairs a missing transition. Only the `present` flag participates in
/// normalization; the remaining fields describe the device and are copied
/// verbatim into synthetic events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    /// A device is physically detected in the slot
    pub present: bool,
    /// Slot description string
    pub description: String,
    /// Manufacturer string
    pub manufacturer: String,
    /// Token serial number (only meaningful while present)
    pub serial: Option<String>,
    /// Hardware version of the device
    pub hardware_version: Version,
    /// Firmware version of the device
    pub firmware_version: Version,
    /// Capability flags
    pub flags: SlotFlags,
}

impl PresenceSnapshot {
    /// Snapshot of an empty slot
    pub fn absent(description: impl Into<String>) -> Self {
        Self {
            present: false,
            description: description.into(),
            manufacturer: String::new(),
            serial: None,
            hardware_version: Version::default(),
            firmware_version: Version::default(),
            flags: SlotFlags::REMOVABLE | SlotFlags::HARDWARE,
        }
    }

    /// Snapshot of a slot holding the token with the given serial
    pub fn present(description: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            present: true,
            serial: Some(serial.into()),
            ..Self::absent(description)
        }
    }

    /// Set the manufacturer string
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    /// Set hardware and firmware versions
    pub fn with_versions(mut self, hardware: Version, firmware: Version) -> Self {
        self.hardware_version = hardware;
        self.firmware_version = firmware;
        self
    }

    /// Replace the capability flags
    pub fn with_flags(mut self, flags: SlotFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Copy of this snapshot with only the presence flag changed
    pub fn with_presence(&self, present: bool) -> Self {
        Self {
            present,
            ..self.clone()
        }
    }
}

/// Presence notification after normalization
///
/// `synthetic` marks events fabricated by the normalizer rather than reported
/// by the driver. Consumers that only care about genuine hardware reports can
/// filter on it; consumers that maintain a present/absent model treat all
/// events alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub slot: SlotId,
    pub snapshot: PresenceSnapshot,
    pub synthetic: bool,
}

impl NormalizedEvent {
    /// Event reported by the driver
    pub fn real(slot: SlotId, snapshot: PresenceSnapshot) -> Self {
        Self {
            slot,
            snapshot,
            synthetic: false,
        }
    }

    /// Event fabricated by the normalizer
    pub fn synthetic(slot: SlotId, snapshot: PresenceSnapshot) -> Self {
        Self {
            slot,
            snapshot,
            synthetic: true,
        }
    }

    pub fn is_present(&self) -> bool {
        self.snapshot.present
    }
}

impl fmt::Display for NormalizedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.snapshot.present {
            "present"
        } else {
            "absent"
        };
        let origin = if self.synthetic { "synthetic" } else { "real" };
        write!(f, "{} {} ({})", self.slot, kind, origin)?;
        if let Some(serial) = &self.snapshot.serial {
            write!(f, " serial={}", serial)?;
        }
        Ok(())
    }
}

/// Live handle to an attached token
///
/// Owned by the device registry while the token is present. The registry
/// drops its copy when the slot reports removal; tearing down whatever the
/// caller opened on the token stays the caller's job.
///
/// Two handles are equal when they refer to the same slot and serial.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    slot: SlotId,
    info: Arc<PresenceSnapshot>,
}

impl DeviceHandle {
    pub fn new(slot: SlotId, info: PresenceSnapshot) -> Self {
        Self {
            slot,
            info: Arc::new(info),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Serial number of the token, if the driver reported one
    pub fn serial(&self) -> Option<&str> {
        self.info.serial.as_deref()
    }

    /// Snapshot the handle was created from
    pub fn info(&self) -> &PresenceSnapshot {
        &self.info
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.info.serial == other.info.serial
    }
}

impl Eq for DeviceHandle {}

impl Hash for DeviceHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.info.serial.hash(state);
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.serial() {
            Some(serial) => write!(f, "{} [{}]", serial, self.slot),
            None => write!(f, "<no serial> [{}]", self.slot),
        }
    }
}

/// Driver lifecycle state
///
/// Reflects the last completed transition, never a partial one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Finalized,
    Initialized,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finalized => write!(f, "Finalized"),
            Self::Initialized => write!(f, "Initialized"),
        }
    }
}

/// Request to move the driver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Initialize,
    Finalize,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize => write!(f, "Initialize"),
            Self::Finalize => write!(f, "Finalize"),
        }
    }
}
