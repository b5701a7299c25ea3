//! Slot event generator
//!
//! Runs on a dedicated thread for the lifetime of one driver session and
//! turns the driver's blocking wait-for-event call into a stream of raw slot
//! events on an unbounded queue.
//!
//! The loop is fault tolerant: driver errors are logged and the wait is
//! reissued after a short backoff. Only session cancellation (checked at the
//! top of every iteration) or the disappearance of the queue consumer stops
//! it. An in-flight wait is never interrupted; how fast the thread exits after
//! cancellation depends on the driver returning from that call.

use crate::driver::SharedDriver;
use crate::session::DriverSession;
use common::QueueSender;
use model::{PresenceSnapshot, SlotId};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Raw notification as reported by the driver
pub type RawSlotEvent = (SlotId, PresenceSnapshot);

/// Granularity of the cancellation check while backing off
const BACKOFF_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Pause after a failed wait before issuing the next one
    pub error_backoff: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_millis(100),
        }
    }
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub events: u64,
    pub empty: u64,
    pub errors: u64,
}

pub struct EventGenerator {
    driver: SharedDriver,
    queue: QueueSender<RawSlotEvent>,
    config: GeneratorConfig,
}

impl EventGenerator {
    pub fn new(
        driver: SharedDriver,
        queue: QueueSender<RawSlotEvent>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            driver,
            queue,
            config,
        }
    }

    /// Start the loop on a session thread named `slot-events`
    pub fn spawn(self, session: &DriverSession) -> common::Result<()> {
        let generation = session.generation();
        session.spawn_thread("slot-events", move |cancel| {
            let stats = self.run(&cancel);
            info!(
                "Slot event generator for session {} stopped: {} events, {} empty waits, {} errors",
                generation, stats.events, stats.empty, stats.errors
            );
        })
    }

    /// Run the wait loop on the current thread until cancelled
    pub fn run(&self, cancel: &CancellationToken) -> GeneratorStats {
        let mut stats = GeneratorStats::default();
        debug!("Slot event generator started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.driver.wait_for_slot_event() {
                Ok(Some((slot, snapshot))) => {
                    trace!("Driver reported {} present={}", slot, snapshot.present);
                    stats.events += 1;
                    if self.queue.push((slot, snapshot)).is_err() {
                        debug!("Slot event queue closed, generator exiting");
                        break;
                    }
                }
                Ok(None) => {
                    stats.empty += 1;
                }
                Err(e) => {
                    stats.errors += 1;
                    if cancel.is_cancelled() {
                        debug!("Slot event wait ended during shutdown: {}", e);
                        break;
                    }
                    if e.is_transient() {
                        warn!("Slot event wait failed: {}, retrying", e);
                    } else {
                        error!("Slot event wait rejected: {}, retrying", e);
                    }
                    Self::backoff(cancel, self.config.error_backoff);
                }
            }
        }

        stats
    }

    fn backoff(cancel: &CancellationToken, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(BACKOFF_STEP.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{SimulatedDriver, TokenDriver};
    use common::unbounded_queue;
    use model::DriverError;
    use std::sync::Arc;
    use std::thread;

    fn snapshot(serial: &str) -> PresenceSnapshot {
        PresenceSnapshot::present("Reader", serial)
    }

    #[test]
    fn test_forwards_events_and_skips_empty_results() {
        let driver = Arc::new(SimulatedDriver::new(2));
        driver.initialize().unwrap();
        driver.inject_empty();
        driver.insert(SlotId(0), snapshot("A"));
        driver.inject_empty();
        driver.insert(SlotId(1), snapshot("B"));

        let (tx, rx) = unbounded_queue();
        let generator = EventGenerator::new(driver.clone(), tx, GeneratorConfig::default());
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            thread::spawn(move || generator.run(&cancel))
        };

        let first = rx.recv_blocking().unwrap();
        let second = rx.recv_blocking().unwrap();
        assert_eq!(first.0, SlotId(0));
        assert_eq!(second.0, SlotId(1));

        cancel.cancel();
        driver.finalize().unwrap();
        let stats = handle.join().unwrap();

        assert_eq!(stats.events, 2);
        assert_eq!(stats.empty, 2);
    }

    #[test]
    fn test_driver_errors_do_not_stop_loop() {
        let driver = Arc::new(SimulatedDriver::new(1));
        driver.initialize().unwrap();
        driver.inject_wait_error(DriverError::vendor(0x30, "device error"));
        driver.inject_wait_error(DriverError::DeviceRemoved);
        driver.insert(SlotId(0), snapshot("A"));

        let (tx, rx) = unbounded_queue();
        let config = GeneratorConfig {
            error_backoff: Duration::from_millis(1),
        };
        let generator = EventGenerator::new(driver.clone(), tx, config);
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            thread::spawn(move || generator.run(&cancel))
        };

        let (slot, _) = rx.recv_blocking().unwrap();
        assert_eq!(slot, SlotId(0));

        cancel.cancel();
        driver.finalize().unwrap();
        let stats = handle.join().unwrap();
        assert_eq!(stats.events, 1);
        // The wake-up caused by finalize may add a third
        assert!(stats.errors >= 2);
    }

    #[test]
    fn test_rejected_wait_is_retried() {
        let driver = Arc::new(SimulatedDriver::new(1));
        driver.initialize().unwrap();
        driver.inject_wait_error(DriverError::SlotNotFound(SlotId(9)));
        driver.insert(SlotId(0), snapshot("A"));

        let (tx, rx) = unbounded_queue();
        let config = GeneratorConfig {
            error_backoff: Duration::from_millis(1),
        };
        let generator = EventGenerator::new(driver.clone(), tx, config);
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            thread::spawn(move || generator.run(&cancel))
        };

        let (slot, _) = rx.recv_blocking().unwrap();
        assert_eq!(slot, SlotId(0));

        cancel.cancel();
        driver.finalize().unwrap();
        let stats = handle.join().unwrap();
        assert_eq!(stats.events, 1);
        assert!(stats.errors >= 1);
    }

    #[test]
    fn test_exits_when_consumer_gone() {
        let driver = Arc::new(SimulatedDriver::new(1));
        driver.initialize().unwrap();
        driver.insert(SlotId(0), snapshot("A"));

        let (tx, rx) = unbounded_queue();
        drop(rx);

        let generator = EventGenerator::new(driver, tx, GeneratorConfig::default());
        let stats = generator.run(&CancellationToken::new());
        assert_eq!(stats.events, 1);
    }

    #[test]
    fn test_cancelled_before_start_issues_no_wait() {
        let driver = Arc::new(SimulatedDriver::new(1));
        driver.initialize().unwrap();

        let (tx, _rx) = unbounded_queue();
        let generator = EventGenerator::new(driver.clone(), tx, GeneratorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(generator.run(&cancel), GeneratorStats::default());
        assert_eq!(driver.calls().wait, 0);
    }
}
