//! Token presence and driver lifecycle
//!
//! This crate keeps a cryptographic token module in step with the host
//! application and turns its raw slot notifications into a clean event
//! stream:
//!
//! - [`lifecycle`]: serialized initialize/finalize bound to foreground and
//!   background, with per-session listener hooks
//! - [`generator`]: blocking wait-for-slot-event loop on a session thread
//! - [`normalizer`]: per-slot repair into strictly alternating events
//! - [`registry`]: attached devices and the shared "first available" waiter
//! - [`watcher`]: wires all of the above around one [`driver::TokenDriver`]
//!
//! # Example
//!
//! ```no_run
//! use presence::driver::SimulatedDriver;
//! use presence::{TokenWatch, TokenWatchConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> common::Result<()> {
//! let watch = TokenWatch::start(Arc::new(SimulatedDriver::new(2)), TokenWatchConfig::default())?;
//! watch.controller().on_host_foreground();
//!
//! let device = watch.registry().first_available().await?;
//! println!("Using token {}", device);
//!
//! watch.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod generator;
pub mod lifecycle;
pub mod normalizer;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod watcher;

pub use driver::{SharedDriver, SimulatedDriver, TokenDriver};
pub use generator::{EventGenerator, GeneratorConfig, GeneratorStats, RawSlotEvent};
pub use lifecycle::{
    LifecycleConfig, LifecycleController, LifecycleListener, LifecycleStatus, next_state,
};
pub use normalizer::{PresenceNormalizer, PresenceTracker, Subscription};
pub use pipeline::PresencePipeline;
pub use registry::DeviceRegistry;
pub use session::DriverSession;
pub use watcher::{TokenWatch, TokenWatchConfig};
