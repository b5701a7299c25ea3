//! Driver session
//!
//! A session spans one `Initialized` period of the driver: it is created by
//! the lifecycle controller right after a successful initialize, handed to
//! every post-init listener, and cancelled and drained before finalize. All
//! background work that depends on the driver (the event generator thread,
//! the normalizer and registry tasks) is spawned through it so that it stops
//! together with the session.

use crate::driver::SharedDriver;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct DriverSession {
    generation: u64,
    driver: SharedDriver,
    runtime: Handle,
    cancel: CancellationToken,
    tasks: TaskTracker,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DriverSession {
    pub(crate) fn new(generation: u64, driver: SharedDriver, runtime: Handle) -> Self {
        Self {
            generation,
            driver,
            runtime,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Sequence number of this session, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.driver
    }

    /// Token cancelled when the session ends
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn a task on the runtime that stops when the session is cancelled
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let generation = self.generation;

        self.tasks.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session {} task '{}' cancelled", generation, name);
                    }
                    _ = task => {
                        debug!("Session {} task '{}' finished", generation, name);
                    }
                }
            },
            &self.runtime,
        );
    }

    /// Spawn a dedicated OS thread for blocking driver calls
    ///
    /// The closure receives the session cancellation token and is expected to
    /// check it between blocking calls.
    pub fn spawn_thread<F>(&self, name: &str, work: F) -> common::Result<()>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || work(cancel))?;

        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for all session tasks to finish
    ///
    /// Must be called from a thread outside the runtime. Returns `false` if
    /// the tasks did not stop within `timeout`.
    pub(crate) fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let tasks = self.tasks.clone();
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, tasks.wait()).await })
            .is_ok()
    }

    /// Join session threads, giving them `grace` to leave the driver
    ///
    /// Threads still stuck in a driver call after that are detached; the
    /// driver owns their return.
    pub(crate) fn reap_threads(&self, grace: Duration) {
        let handles: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && handles.iter().any(|h| !h.is_finished()) {
            std::thread::sleep(REAP_POLL_INTERVAL);
        }

        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Session {} thread '{}' panicked", self.generation, name);
                }
            } else {
                warn!(
                    "Session {} thread '{}' still blocked in driver, detaching",
                    self.generation, name
                );
            }
        }
    }
}

impl std::fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSession")
            .field("generation", &self.generation)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
