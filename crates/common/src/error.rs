//! Common error types

use model::{DriverError, LifecycleState, Trigger};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Cooperative shutdown of the owning session, not a failure
    #[error("Cancelled")]
    Cancelled,

    /// A driver call would break initialize/finalize alternation
    #[error("State invariant violated: {trigger} requested while driver is {state}")]
    StateInvariant {
        state: LifecycleState,
        trigger: Trigger,
    },

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
