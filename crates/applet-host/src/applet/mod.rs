//! Applet - one supervised child process.
//!
//! Flow:
//! 1. `register` allocates pipes and prepares the command (state: Registered)
//! 2. `start` publishes Started and spawns the read task and the manager task
//! 3. The manager task launches the process, then waits on stop / error /
//!    lifecycle events / outbound messages
//! 4. On stop or error: close stdin, reap the process exactly once, join the
//!    read task, publish Stopped or Crashed
//!
//! State has a single writer at any time. The `watch::Sender` lives in the
//! pending launch until `start` (or an early `stop`) takes it, and belongs to
//! the manager task from then on. Everybody else reads snapshots.

mod manager;
mod reader;
mod signal;

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::{mpsc, watch};

use crate::bridge::protocol::{AppletId, AppletMessage};
use crate::config::{AppletConfig, Invocation};
use crate::dispatcher::{CoreDispatcher, Dispatcher};
use crate::process::{ProcessHandle, SetupError};
use crate::state::AppletState;

use manager::Manager;
use signal::StopSignal;

/// Caller-facing misuse errors. Transport and process failures never surface
/// here; they show up as a terminal state.
#[derive(Debug, thiserror::Error)]
pub enum AppletError {
    #[error("applet {id} cannot start from state {state}")]
    NotStartable { id: AppletId, state: AppletState },
    #[error("applet {id} already started; its dispatcher is fixed")]
    DispatcherFixed { id: AppletId },
    #[error("applet {id} is closed")]
    Closed { id: AppletId },
}

/// Lifecycle reports from dispatchers, applied by the manager task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LifecycleEvent {
    Ready,
    Failed { reason: String },
}

/// Cloneable view of an applet handed to dispatchers.
#[derive(Clone)]
pub struct AppletHandle {
    id: AppletId,
    state_rx: watch::Receiver<AppletState>,
    stop: StopSignal,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    outbound_tx: mpsc::Sender<AppletMessage>,
}

impl AppletHandle {
    pub fn id(&self) -> AppletId {
        self.id
    }

    pub fn state(&self) -> AppletState {
        *self.state_rx.borrow()
    }

    /// Report that the applet signalled readiness (`Started|Failed -> Running`).
    pub fn mark_running(&self) {
        let _ = self.events_tx.send(LifecycleEvent::Ready);
    }

    /// Report an application-level failure (`Running -> Failed`). The process
    /// keeps running.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let _ = self.events_tx.send(LifecycleEvent::Failed {
            reason: reason.into(),
        });
    }

    /// Request a graceful stop. Idempotent.
    pub fn stop(&self) {
        if self.stop.request() {
            tracing::info!(applet_id = %self.id, "Applet stop requested");
        }
    }

    /// Queue a message for the applet's stdin. No delivery acknowledgement.
    pub async fn send(&self, message: AppletMessage) -> Result<(), AppletError> {
        if self.stop.is_raised() || self.state().is_terminal() {
            return Err(AppletError::Closed { id: self.id });
        }
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| AppletError::Closed { id: self.id })
    }
}

impl std::fmt::Debug for AppletHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppletHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything `start` consumes. Present only while the applet is Registered.
struct Launch {
    process: ProcessHandle,
    state_tx: watch::Sender<AppletState>,
    dispatcher: Arc<dyn Dispatcher>,
    events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    outbound_rx: mpsc::Receiver<AppletMessage>,
}

/// A supervised child process speaking the applet protocol over stdio.
pub struct Applet {
    handle: AppletHandle,
    invocation: Invocation,
    config: AppletConfig,
    launch: StdMutex<Option<Launch>>,
}

impl Applet {
    /// Register an applet with default settings and the logging dispatcher.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime with I/O enabled.
    pub fn register(invocation: Invocation) -> Result<Self, SetupError> {
        Self::register_with(invocation, AppletConfig::default())
    }

    /// Register an applet: allocate its pipes and prepare its command.
    pub fn register_with(invocation: Invocation, config: AppletConfig) -> Result<Self, SetupError> {
        let id = AppletId::new();
        let (state_tx, state_rx) = watch::channel(AppletState::Uninitialized);

        let process = ProcessHandle::new(id, &invocation)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));

        state_tx.send_replace(AppletState::Registered);
        tracing::info!(applet_id = %id, %invocation, "Applet registered");

        Ok(Self {
            handle: AppletHandle {
                id,
                state_rx,
                stop: StopSignal::new(),
                events_tx,
                outbound_tx,
            },
            invocation,
            config,
            launch: StdMutex::new(Some(Launch {
                process,
                state_tx,
                dispatcher: Arc::new(CoreDispatcher),
                events_rx,
                outbound_rx,
            })),
        })
    }

    pub fn id(&self) -> AppletId {
        self.handle.id
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn state(&self) -> AppletState {
        self.handle.state()
    }

    /// Receiver that observes every published state change.
    pub fn subscribe(&self) -> watch::Receiver<AppletState> {
        self.handle.state_rx.clone()
    }

    pub fn handle(&self) -> AppletHandle {
        self.handle.clone()
    }

    /// Replace the dispatcher. Only allowed before `start`.
    pub fn set_dispatcher(&self, dispatcher: impl Dispatcher) -> Result<(), AppletError> {
        let mut launch = self.lock_launch();
        match launch.as_mut() {
            Some(launch) => {
                launch.dispatcher = Arc::new(dispatcher);
                Ok(())
            }
            None => Err(AppletError::DispatcherFixed { id: self.id() }),
        }
    }

    /// Start the applet: `Registered -> Started`, then launch the process and
    /// both background tasks without waiting for the applet to be ready.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&self) -> Result<(), AppletError> {
        let Some(launch) = self.lock_launch().take() else {
            return Err(AppletError::NotStartable {
                id: self.id(),
                state: self.state(),
            });
        };
        let Launch {
            mut process,
            state_tx,
            dispatcher,
            events_rx,
            outbound_rx,
        } = launch;

        let Some(stdout) = process.take_stdout() else {
            return Err(AppletError::NotStartable {
                id: self.id(),
                state: self.state(),
            });
        };

        state_tx.send_replace(AppletState::Started);
        tracing::info!(applet_id = %self.id(), "Applet started");

        let (errors_tx, errors_rx) = mpsc::channel(1);

        let reader = tokio::spawn(reader::run(
            self.handle.clone(),
            stdout,
            dispatcher,
            errors_tx,
        ));

        let manager = Manager {
            id: self.id(),
            process,
            state_tx,
            stop: self.handle.stop.clone(),
            config: self.config.clone(),
            errors_rx,
            events_rx,
            outbound_rx,
            reader,
        };
        tokio::spawn(manager.run());

        Ok(())
    }

    /// Request a graceful stop. Idempotent, never waits.
    ///
    /// An applet that was never started is torn down on the spot: its pipes
    /// are released and it moves straight to `Stopped`.
    pub fn stop(&self) {
        self.handle.stop();

        if let Some(launch) = self.lock_launch().take() {
            launch.state_tx.send_replace(AppletState::Stopped);
            tracing::info!(applet_id = %self.id(), "Applet stopped before start");
        }
    }

    /// Queue a message for the applet's stdin.
    pub async fn send(&self, message: AppletMessage) -> Result<(), AppletError> {
        self.handle.send(message).await
    }

    /// Wait until the applet reaches a terminal state. By then the process has
    /// been reaped and both background tasks have exited.
    pub async fn wait(&self) -> AppletState {
        let mut rx = self.subscribe();
        if let Ok(state) = rx.wait_for(AppletState::is_terminal).await {
            return *state;
        }
        // Manager gone without publishing a terminal state.
        let state = *rx.borrow();
        state
    }

    /// `stop` followed by `wait`.
    pub async fn shutdown(&self) -> AppletState {
        self.stop();
        self.wait().await
    }

    fn lock_launch(&self) -> MutexGuard<'_, Option<Launch>> {
        match self.launch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(applet_id = %self.id(), "Applet launch mutex poisoned");
                poisoned.into_inner()
            }
        }
    }
}

impl std::fmt::Debug for Applet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applet")
            .field("id", &self.id())
            .field("invocation", &self.invocation)
            .field("state", &self.state())
            .finish()
    }
}
