//! Driver lifecycle controller
//!
//! Binds the native module's initialize/finalize calls to the host
//! application's foreground/background lifecycle. Requests are queued from
//! any thread and executed strictly in arrival order by a single worker
//! thread (`token-lifecycle`), so the driver never sees two lifecycle calls
//! at once and never sees the same call twice in a row.
//!
//! Every initialize starts a new [`DriverSession`] that is handed to the
//! registered [`LifecycleListener`]s; every finalize tears it down again.

use crate::driver::SharedDriver;
use crate::session::DriverSession;
use common::{Error, QueueReceiver, QueueSender, unbounded_queue};
use model::{LifecycleState, Trigger};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Hooks invoked by the lifecycle worker around driver calls
///
/// Hooks run on the worker thread and may block, but every queued lifecycle
/// request waits for them. Errors and panics are logged and recorded in the
/// controller status; they never stop the worker.
pub trait LifecycleListener: Send + Sync + 'static {
    /// Called after a successful driver initialize with the new session
    fn post_init(&self, session: &DriverSession) -> common::Result<()>;

    /// Called before the session is cancelled and the driver finalized
    fn pre_finalize(&self, session: &DriverSession) -> common::Result<()>;

    /// Name used in log messages
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// How long finalize waits for session tasks and threads to stop
    pub session_drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            session_drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Observable state of the controller
#[derive(Debug, Clone, Default)]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    /// Number of sessions created so far
    pub generation: u64,
    /// Failure of the most recent transition, if any
    pub last_error: Option<Arc<Error>>,
}

/// Transition table
///
/// Returns the target state, or `None` when the trigger does not apply to
/// `state` and must be ignored.
pub fn next_state(state: LifecycleState, trigger: Trigger) -> Option<LifecycleState> {
    match (state, trigger) {
        (LifecycleState::Finalized, Trigger::Initialize) => Some(LifecycleState::Initialized),
        (LifecycleState::Initialized, Trigger::Finalize) => Some(LifecycleState::Finalized),
        (LifecycleState::Finalized, Trigger::Finalize) => None,
        (LifecycleState::Initialized, Trigger::Initialize) => None,
    }
}

enum Command {
    Trigger(Trigger),
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

type Listeners = Arc<RwLock<Vec<Arc<dyn LifecycleListener>>>>;

/// Handle to the lifecycle worker
///
/// Dropping the controller closes the request queue; the worker then
/// finalizes the driver if needed and exits on its own.
pub struct LifecycleController {
    commands: QueueSender<Command>,
    listeners: Listeners,
    status: watch::Receiver<LifecycleStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleController {
    /// Start the worker thread in the `Finalized` state
    ///
    /// `runtime` is used for session tasks.
    pub fn spawn(
        driver: SharedDriver,
        config: LifecycleConfig,
        runtime: Handle,
    ) -> common::Result<Self> {
        let (commands, queue) = unbounded_queue();
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let (status_tx, status) = watch::channel(LifecycleStatus::default());

        let worker = Worker {
            driver,
            config,
            runtime,
            listeners: listeners.clone(),
            status: status_tx,
            state: LifecycleState::Finalized,
            generation: 0,
            session: None,
            notified: Vec::new(),
            last_call: None,
        };

        let handle = std::thread::Builder::new()
            .name("token-lifecycle".to_string())
            .spawn(move || worker.run(queue))?;

        Ok(Self {
            commands,
            listeners,
            status,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue an initialize request; returns immediately
    pub fn request_initialize(&self) {
        self.send(Command::Trigger(Trigger::Initialize));
    }

    /// Queue a finalize request; returns immediately
    pub fn request_finalize(&self) {
        self.send(Command::Trigger(Trigger::Finalize));
    }

    /// Host application moved to the foreground
    pub fn on_host_foreground(&self) {
        self.request_initialize();
    }

    /// Host application moved to the background
    ///
    /// Transient backgrounds (configuration changes and the like) keep the
    /// driver initialized.
    pub fn on_host_background(&self, is_transient: bool) {
        if is_transient {
            debug!("Transient background, keeping driver initialized");
            return;
        }
        self.request_finalize();
    }

    /// Register a listener for subsequent transitions
    ///
    /// Listeners are invoked in registration order. A listener added while a
    /// session is running sees neither that session's post-init nor its
    /// pre-finalize; its first hook is the next session's post-init.
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        debug!("Adding lifecycle listener {}", listener.name());
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn state(&self) -> LifecycleState {
        self.status.borrow().state
    }

    pub fn status(&self) -> LifecycleStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<LifecycleStatus> {
        self.status.clone()
    }

    /// Wait until every request queued before this call has been handled
    pub async fn sync(&self) -> common::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands.push(Command::Barrier(tx))?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Finalize if needed, stop the worker and join its thread
    pub async fn shutdown(&self) -> common::Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.push(Command::Shutdown(tx)).is_ok() {
            // The worker may already be gone; joining below covers that
            let _ = rx.await;
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| Error::Other(format!("Lifecycle join failed: {}", e)))?
                .map_err(|_| Error::Other("Lifecycle worker panicked".to_string()))?;
        }

        self.commands.close();
        Ok(())
    }

    fn send(&self, command: Command) {
        if self.commands.push(command).is_err() {
            warn!("Lifecycle worker stopped, request dropped");
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.commands.close();
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

struct Worker {
    driver: SharedDriver,
    config: LifecycleConfig,
    runtime: Handle,
    listeners: Listeners,
    status: watch::Sender<LifecycleStatus>,
    state: LifecycleState,
    generation: u64,
    session: Option<Arc<DriverSession>>,
    /// Listeners that received post-init for the running session
    notified: Vec<Arc<dyn LifecycleListener>>,
    /// Last lifecycle call issued against the driver
    last_call: Option<Trigger>,
}

impl Worker {
    fn run(mut self, queue: QueueReceiver<Command>) {
        info!("Lifecycle worker started");

        loop {
            match queue.recv_blocking() {
                Ok(Command::Trigger(trigger)) => self.handle(trigger),
                Ok(Command::Barrier(done)) => {
                    let _ = done.send(());
                }
                Ok(Command::Shutdown(done)) => {
                    self.handle(Trigger::Finalize);
                    let _ = done.send(());
                    break;
                }
                Err(_) => {
                    debug!("Lifecycle queue closed");
                    self.handle(Trigger::Finalize);
                    break;
                }
            }
        }

        info!("Lifecycle worker stopped");
    }

    fn handle(&mut self, trigger: Trigger) {
        let Some(next) = next_state(self.state, trigger) else {
            debug!("Ignoring {} while {}", trigger, self.state);
            return;
        };

        info!("Lifecycle {} -> {} ({})", self.state, next, trigger);

        let result = panic::catch_unwind(AssertUnwindSafe(|| match trigger {
            Trigger::Initialize => self.initialize(),
            Trigger::Finalize => self.finalize(),
        }))
        .unwrap_or_else(|panic| {
            Err(Error::Other(format!(
                "{} panicked: {}",
                trigger,
                panic_message(panic.as_ref())
            )))
        });

        if let Err(e) = &result {
            error!("Lifecycle {} failed: {}", trigger, e);
        }

        // The state follows the trigger even when the action failed
        self.state = next;
        let generation = self.generation;
        self.status.send_replace(LifecycleStatus {
            state: next,
            generation,
            last_error: result.err().map(Arc::new),
        });
    }

    fn initialize(&mut self) -> common::Result<()> {
        self.guard(Trigger::Initialize)?;
        self.driver.initialize()?;

        self.generation += 1;
        let session = Arc::new(DriverSession::new(
            self.generation,
            self.driver.clone(),
            self.runtime.clone(),
        ));
        self.session = Some(session.clone());
        debug!("Session {} started", session.generation());

        self.notified = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        notify(&self.notified, "post-init", &session, |listener, session| {
            listener.post_init(session)
        })
    }

    fn finalize(&mut self) -> common::Result<()> {
        self.guard(Trigger::Finalize)?;

        let Some(session) = self.session.take() else {
            // Initialize failed, so there is no session to tear down
            return Ok(self.driver.finalize()?);
        };

        // Only the listeners that saw this session start hear about its end
        let listeners = std::mem::take(&mut self.notified);
        let notified = notify(&listeners, "pre-finalize", &session, |listener, session| {
            listener.pre_finalize(session)
        });

        session.cancel();
        if !session.drain(self.config.session_drain_timeout) {
            warn!(
                "Session {} tasks did not stop within {:?}",
                session.generation(),
                self.config.session_drain_timeout
            );
        }

        let finalized = self.driver.finalize();
        session.reap_threads(self.config.session_drain_timeout);
        debug!("Session {} ended", session.generation());

        finalized?;
        notified
    }

    /// Refuse a driver call that would repeat the previous one
    fn guard(&mut self, call: Trigger) -> common::Result<()> {
        if self.last_call == Some(call) {
            return Err(Error::StateInvariant {
                state: self.state,
                trigger: call,
            });
        }
        self.last_call = Some(call);
        Ok(())
    }
}

/// Invoke a hook on every listener in registration order
///
/// Each listener runs in isolation. The first failure is returned.
fn notify<F>(
    listeners: &[Arc<dyn LifecycleListener>],
    phase: &str,
    session: &DriverSession,
    hook: F,
) -> common::Result<()>
where
    F: Fn(&dyn LifecycleListener, &DriverSession) -> common::Result<()>,
{
    let mut first_error = None;
    for listener in listeners {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook(listener.as_ref(), session)));
        let error = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(panic) => Error::Listener(format!(
                "{} panicked in {}: {}",
                listener.name(),
                phase,
                panic_message(panic.as_ref())
            )),
        };
        warn!("Listener {} failed in {}: {}", listener.name(), phase, error);
        first_error.get_or_insert(error);
    }

    first_error.map_or(Ok(()), Err)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use LifecycleState::*;

        assert_eq!(next_state(Finalized, Trigger::Initialize), Some(Initialized));
        assert_eq!(next_state(Initialized, Trigger::Finalize), Some(Finalized));
        assert_eq!(next_state(Finalized, Trigger::Finalize), None);
        assert_eq!(next_state(Initialized, Trigger::Initialize), None);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_default_config() {
        assert_eq!(
            LifecycleConfig::default().session_drain_timeout,
            Duration::from_secs(2)
        );
        assert_eq!(LifecycleStatus::default().state, LifecycleState::Finalized);
    }
}
