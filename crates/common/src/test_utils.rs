//! Test utilities for tokenwatch
//!
//! Provides snapshot builders and async helpers for tests across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_present_snapshot, slot};
//!
//! let snapshot = create_present_snapshot(1);
//! assert!(snapshot.present);
//! assert_eq!(snapshot.serial.as_deref(), Some("SN000001"));
//! assert_eq!(slot(1).0, 1);
//! ```

use model::{NormalizedEvent, PresenceSnapshot, SlotFlags, SlotId, Version};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Shorthand for a slot identity
pub fn slot(id: u64) -> SlotId {
    SlotId(id)
}

/// Serial number used by the builders for token `id`
pub fn mock_serial(id: u32) -> String {
    format!("SN{:06}", id)
}

/// Snapshot of a slot holding mock token `id`
pub fn create_present_snapshot(id: u32) -> PresenceSnapshot {
    PresenceSnapshot::present(format!("Mock Reader {}", id), mock_serial(id))
        .with_manufacturer("Mock Tokens Ltd")
        .with_versions(Version::new(1, 0), Version::new(2, id as u8))
        .with_flags(
            SlotFlags::REMOVABLE
                | SlotFlags::HARDWARE
                | SlotFlags::TOKEN_INITIALIZED
                | SlotFlags::LOGIN_REQUIRED,
        )
}

/// Snapshot of an empty slot
pub fn create_absent_snapshot(id: u32) -> PresenceSnapshot {
    PresenceSnapshot::absent(format!("Mock Reader {}", id))
}

/// Reduce an event stream to `(slot, present, synthetic)` triples
///
/// Handy for asserting on event sequences without spelling out snapshots.
pub fn event_shape(events: &[NormalizedEvent]) -> Vec<(u64, bool, bool)> {
    events
        .iter()
        .map(|e| (e.slot.0, e.snapshot.present, e.synthetic))
        .collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` until it holds or `duration` elapses
///
/// Returns whether the condition was met.
pub async fn wait_until<F>(duration: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let present = create_present_snapshot(7);
        let absent = create_absent_snapshot(7);

        assert!(present.present);
        assert!(!absent.present);
        assert_eq!(present.description, absent.description);
        assert_eq!(present.serial.as_deref(), Some("SN000007"));
        assert!(absent.serial.is_none());
    }

    #[test]
    fn test_event_shape() {
        let events = vec![
            NormalizedEvent::synthetic(slot(1), create_absent_snapshot(1)),
            NormalizedEvent::real(slot(1), create_present_snapshot(2)),
        ];
        assert_eq!(event_shape(&events), vec![(1, false, true), (1, true, false)]);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
        let err = result.unwrap_err();
        assert_eq!(err.duration, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_wait_until() {
        let mut calls = 0;
        let met = wait_until(Duration::from_secs(1), || {
            calls += 1;
            calls >= 3
        })
        .await;
        assert!(met);
        assert!(!wait_until(Duration::from_millis(20), || false).await);
    }
}
