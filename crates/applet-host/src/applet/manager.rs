//! Manager task - owns the lifecycle state and the process teardown.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::LifecycleEvent;
use super::reader::ReadFault;
use super::signal::StopSignal;
use crate::bridge::codec::ProtocolError;
use crate::bridge::protocol::{AppletId, AppletMessage};
use crate::config::AppletConfig;
use crate::process::ProcessHandle;
use crate::state::AppletState;

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The stop signal fired first.
    Stop,
    /// Start failure or an output error fired first.
    Fault {
        /// A caller had already asked for a stop when the fault happened.
        stop_requested: bool,
    },
}

impl Exit {
    fn fault(stop: &StopSignal) -> Self {
        Self::Fault {
            stop_requested: stop.was_requested(),
        }
    }

    /// How long to wait for the process after stdin closes. A requested stop
    /// honours the configured timeout; an unrequested fault always escalates.
    fn reap_timeout(self, config: &AppletConfig) -> Option<Duration> {
        match self {
            Self::Stop | Self::Fault { stop_requested: true } => config.stop_timeout,
            Self::Fault { stop_requested: false } => {
                Some(config.stop_timeout.unwrap_or(config.kill_grace))
            }
        }
    }

    fn terminal_state(self) -> AppletState {
        match self {
            Self::Stop | Self::Fault { stop_requested: true } => AppletState::Stopped,
            Self::Fault { stop_requested: false } => AppletState::Crashed,
        }
    }
}

pub(super) struct Manager {
    pub(super) id: AppletId,
    pub(super) process: ProcessHandle,
    pub(super) state_tx: watch::Sender<AppletState>,
    pub(super) stop: StopSignal,
    pub(super) config: AppletConfig,
    pub(super) errors_rx: mpsc::Receiver<ReadFault>,
    pub(super) events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    pub(super) outbound_rx: mpsc::Receiver<AppletMessage>,
    pub(super) reader: JoinHandle<()>,
}

impl Manager {
    pub(super) async fn run(mut self) {
        let exit = match self.process.spawn() {
            Ok(pid) => {
                tracing::info!(applet_id = %self.id, pid, "Applet process launched");
                self.supervise().await
            }
            Err(e) => {
                tracing::error!(applet_id = %self.id, error = %e, "Applet process failed to start");
                Exit::fault(&self.stop)
            }
        };
        self.teardown(exit).await;
    }

    async fn supervise(&mut self) -> Exit {
        loop {
            tokio::select! {
                biased;

                // Ahead of stop: a fault read before a stop request still crashes.
                fault = self.errors_rx.recv() => {
                    let Some(fault) = fault else {
                        // The read task also exits quietly once a stop is requested.
                        if self.stop.was_requested() {
                            return Exit::Stop;
                        }
                        tracing::error!(applet_id = %self.id, "Read task ended without reporting");
                        return Exit::fault(&self.stop);
                    };
                    match fault.error {
                        ProtocolError::EndOfStream => {
                            tracing::info!(applet_id = %self.id, "Applet output ended");
                        }
                        ref err => {
                            tracing::error!(
                                applet_id = %self.id,
                                error = %err,
                                kind = err.as_label(),
                                "Applet protocol error"
                            );
                        }
                    }
                    return Exit::Fault {
                        stop_requested: fault.stop_requested,
                    };
                }

                _ = self.stop.raised() => return Exit::Stop,

                Some(event) = self.events_rx.recv() => self.apply(event),

                Some(message) = self.outbound_rx.recv() => {
                    let kind = message.kind.clone();
                    tokio::select! {
                        biased;
                        _ = self.stop.raised() => return Exit::Stop,
                        result = self.process.send(message) => {
                            if let Err(e) = result {
                                tracing::warn!(applet_id = %self.id, %kind, error = %e, "Failed to send message to applet");
                            }
                        }
                    }
                }
            }
        }
    }

    fn apply(&mut self, event: LifecycleEvent) {
        let next = match event {
            LifecycleEvent::Ready => AppletState::Running,
            LifecycleEvent::Failed { ref reason } => {
                tracing::warn!(applet_id = %self.id, %reason, "Applet reported failure");
                AppletState::Failed
            }
        };
        let current = *self.state_tx.borrow();
        if current.can_transition_to(next) {
            self.publish(next);
        } else {
            tracing::debug!(applet_id = %self.id, from = %current, to = %next, "Ignoring lifecycle event");
        }
    }

    fn publish(&self, next: AppletState) {
        let previous = self.state_tx.send_replace(next);
        tracing::info!(applet_id = %self.id, from = %previous, to = %next, "Applet state changed");
    }

    /// The single exit path: every way out of `run` lands here exactly once.
    async fn teardown(mut self, exit: Exit) {
        // Stop the reader and refuse further outbound messages.
        self.stop.raise();
        self.outbound_rx.close();

        self.process.close_stdin();
        let status = self
            .process
            .reap(exit.reap_timeout(&self.config), self.config.kill_grace)
            .await;

        if let Err(e) = (&mut self.reader).await
            && e.is_panic()
        {
            tracing::error!(applet_id = %self.id, "Read task panicked");
        }

        let terminal = exit.terminal_state();

        tracing::info!(
            applet_id = %self.id,
            state = %terminal,
            exit_status = ?status,
            "Applet terminated"
        );
        self.publish(terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_without_request_is_a_crash() {
        let stop = StopSignal::new();
        stop.raise();
        assert_eq!(Exit::fault(&stop).terminal_state(), AppletState::Crashed);
    }

    #[test]
    fn fault_during_requested_stop_is_a_stop() {
        let stop = StopSignal::new();
        stop.request();
        assert_eq!(Exit::fault(&stop).terminal_state(), AppletState::Stopped);
        assert_eq!(Exit::Stop.terminal_state(), AppletState::Stopped);
    }

    #[test]
    fn unrequested_fault_bounds_the_reap() {
        let config = AppletConfig::new().with_kill_grace(Duration::from_secs(3));
        let fault = Exit::Fault {
            stop_requested: false,
        };
        let fault_during_stop = Exit::Fault {
            stop_requested: true,
        };
        assert_eq!(Exit::Stop.reap_timeout(&config), None);
        assert_eq!(fault_during_stop.reap_timeout(&config), None);
        assert_eq!(fault.reap_timeout(&config), Some(Duration::from_secs(3)));

        let config = config.with_stop_timeout(Duration::from_millis(100));
        assert_eq!(
            Exit::Stop.reap_timeout(&config),
            Some(Duration::from_millis(100))
        );
        assert_eq!(fault.reap_timeout(&config), Some(Duration::from_millis(100)));
    }

    fn malformed() -> ProtocolError {
        let err = serde_json::from_str::<serde_json::Value>("{oops}").unwrap_err();
        ProtocolError::Malformed(err)
    }

    /// Run a manager over `exec cat` with `fault` already queued and a stop
    /// already requested, as if both landed before the manager was polled.
    async fn run_with_queued_fault(fault: ReadFault) -> AppletState {
        let id = AppletId::new();
        let invocation = crate::config::Invocation::new("/bin/sh").args(["-c", "exec cat"]);
        let mut process = ProcessHandle::new(id, &invocation).unwrap();
        drop(process.take_stdout());

        let (state_tx, mut state_rx) = watch::channel(AppletState::Started);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (_outbound_tx, outbound_rx) = mpsc::channel(1);
        errors_tx.send(fault).await.unwrap();

        let stop = StopSignal::new();
        stop.request();

        let manager = Manager {
            id,
            process,
            state_tx,
            stop,
            config: AppletConfig::new(),
            errors_rx,
            events_rx,
            outbound_rx,
            reader: tokio::spawn(async {}),
        };
        tokio::time::timeout(Duration::from_secs(10), manager.run())
            .await
            .unwrap();

        let state = *state_rx.borrow_and_update();
        state
    }

    #[tokio::test]
    async fn fault_read_before_stop_request_crashes() {
        let fault = ReadFault {
            error: malformed(),
            stop_requested: false,
        };
        assert_eq!(run_with_queued_fault(fault).await, AppletState::Crashed);
    }

    #[tokio::test]
    async fn fault_read_after_stop_request_stops() {
        let fault = ReadFault {
            error: malformed(),
            stop_requested: true,
        };
        assert_eq!(run_with_queued_fault(fault).await, AppletState::Stopped);
    }
}
