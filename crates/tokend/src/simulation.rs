//! Simulated token churn
//!
//! Without hardware the daemon drives a [`SimulatedDriver`] and keeps it
//! busy with random token activity, including the sloppy notifications real
//! modules produce (swaps without a removal, repeated reports).

use model::{PresenceSnapshot, SlotFlags, SlotId, Version};
use presence::SimulatedDriver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// One random change applied to the simulated module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChurnAction {
    Insert { slot: SlotId, serial: String },
    Remove { slot: SlotId },
    Swap { slot: SlotId, serial: String },
    Repeat { slot: SlotId },
}

pub struct Churn {
    driver: Arc<SimulatedDriver>,
    rng: StdRng,
    serial_prefix: String,
    next_serial: u32,
}

impl Churn {
    pub fn new(driver: Arc<SimulatedDriver>, serial_prefix: &str, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            driver,
            rng,
            serial_prefix: serial_prefix.to_string(),
            next_serial: 1,
        }
    }

    /// Pick and apply one action
    pub fn step(&mut self) -> Option<ChurnAction> {
        let slots = self.driver.slot_ids();
        if slots.is_empty() {
            return None;
        }
        let slot = slots[self.rng.random_range(0..slots.len())];

        let action = if !self.driver.is_present(slot) {
            ChurnAction::Insert {
                slot,
                serial: self.next_serial(),
            }
        } else {
            match self.rng.random_range(0..10) {
                0..=5 => ChurnAction::Remove { slot },
                6..=8 => ChurnAction::Swap {
                    slot,
                    serial: self.next_serial(),
                },
                _ => ChurnAction::Repeat { slot },
            }
        };

        self.apply(&action);
        Some(action)
    }

    fn apply(&self, action: &ChurnAction) {
        debug!("Simulation: {:?}", action);
        match action {
            ChurnAction::Insert { slot, serial } => {
                self.driver.insert(*slot, token_snapshot(*slot, serial));
            }
            ChurnAction::Remove { slot } => self.driver.remove(*slot),
            ChurnAction::Swap { slot, serial } => {
                self.driver.swap(*slot, token_snapshot(*slot, serial));
            }
            ChurnAction::Repeat { slot } => self.driver.repeat_last(*slot),
        }
    }

    fn next_serial(&mut self) -> String {
        let serial = format!("{}{:08X}", self.serial_prefix, self.next_serial);
        self.next_serial += 1;
        serial
    }

    /// Apply an action every `interval` until the task is aborted
    pub fn spawn(mut self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.step();
            }
        })
    }
}

/// Descriptive data of a simulated token in `slot`
pub fn token_snapshot(slot: SlotId, serial: &str) -> PresenceSnapshot {
    PresenceSnapshot::present(format!("Simulated Reader {}", slot.0), serial)
        .with_manufacturer("tokenwatch simulator")
        .with_versions(Version::new(1, 0), Version::new(1, 2))
        .with_flags(
            SlotFlags::REMOVABLE
                | SlotFlags::HARDWARE
                | SlotFlags::TOKEN_INITIALIZED
                | SlotFlags::LOGIN_REQUIRED,
        )
}
