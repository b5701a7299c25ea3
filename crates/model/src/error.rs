//! Driver boundary error types

use crate::types::SlotId;
use thiserror::Error;

/// Failure reported by the native token driver
///
/// The event generator retries every wait failure. Errors that are not
/// [transient](DriverError::is_transient) are logged at error level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The module has not been initialized, or was finalized while a call
    /// was in flight
    #[error("Driver not initialized")]
    NotInitialized,

    /// Initialize was called on an already initialized module
    #[error("Driver already initialized")]
    AlreadyInitialized,

    /// The slot identity is not known to the driver
    #[error("Slot not found: {0}")]
    SlotNotFound(SlotId),

    /// The token was pulled while the driver was talking to it
    #[error("Device removed")]
    DeviceRemoved,

    /// Vendor specific return code
    #[error("Vendor error {code:#010x}: {message}")]
    Vendor { code: u32, message: String },

    /// Loading or talking to the module failed at the OS level
    #[error("I/O error: {0}")]
    Io(String),
}

impl DriverError {
    /// Create a vendor error from a raw return code
    pub fn vendor(code: u32, message: impl Into<String>) -> Self {
        Self::Vendor {
            code,
            message: message.into(),
        }
    }

    /// Whether retrying the same call later can succeed
    ///
    /// `AlreadyInitialized` and `SlotNotFound` describe a caller mistake rather
    /// than a device condition.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::AlreadyInitialized | Self::SlotNotFound(_))
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Type alias for driver call results
pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::vendor(0x8000_0001, "token locked");
        assert_eq!(err.to_string(), "Vendor error 0x80000001: token locked");

        let err = DriverError::SlotNotFound(SlotId(7));
        assert_eq!(err.to_string(), "Slot not found: slot#7");
    }

    #[test]
    fn test_transient_classification() {
        assert!(DriverError::NotInitialized.is_transient());
        assert!(DriverError::DeviceRemoved.is_transient());
        assert!(DriverError::vendor(5, "general error").is_transient());
        assert!(!DriverError::AlreadyInitialized.is_transient());
        assert!(!DriverError::SlotNotFound(SlotId(1)).is_transient());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "libtoken.so");
        let err: DriverError = io.into();
        assert!(matches!(err, DriverError::Io(ref msg) if msg.contains("libtoken.so")));
    }
}
