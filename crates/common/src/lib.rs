//! Common utilities for tokenwatch
//!
//! This crate provides functionality shared by the presence core and the
//! daemon: the workspace error type, tracing setup, the unbounded queue that
//! bridges blocking driver threads and the Tokio runtime, and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{QueueReceiver, QueueSender, unbounded_queue};
pub use error::{Error, Result};
pub use logging::setup_logging;
