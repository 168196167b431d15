//! Process handle - owns the applet's OS process and its stdio pipes.
//!
//! Pipes are allocated at registration, before the process exists, so a
//! resource-exhausted host fails early with [`SetupError`] instead of at start.
//! The child's ends are parked inside the prepared command and closed in the
//! parent right after spawn (successful or not) so that EOF propagates.
//!
//! Only the manager task touches a started handle. Dropping a handle whose
//! process was never reaped kills the process.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::SinkExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::{JsonStreamCodec, ProtocolError};
use crate::bridge::protocol::{AppletId, AppletMessage};
use crate::config::Invocation;

pub(crate) type StdinWriter = FramedWrite<pipe::Sender, JsonStreamCodec<AppletMessage>>;

/// Registration failures. The applet is unusable and must not be started.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invocation has an empty program path")]
    EmptyProgram,
    #[error("failed to allocate {stream} pipe: {source}")]
    Pipe {
        stream: &'static str,
        #[source]
        source: io::Error,
    },
}

/// The OS refused to launch the applet.
#[derive(Debug, thiserror::Error)]
pub enum ProcessStartError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("process already started")]
    AlreadyStarted,
}

fn pipe_error(stream: &'static str) -> impl FnOnce(io::Error) -> SetupError {
    move |source| SetupError::Pipe { stream, source }
}

pub(crate) struct ProcessHandle {
    id: AppletId,
    program: String,
    command: Option<Command>,
    child: Option<Child>,
    stdin: Option<StdinWriter>,
    stdout: Option<pipe::Receiver>,
}

impl ProcessHandle {
    /// Prepare the command and allocate its stdin/stdout pipes.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime with I/O enabled.
    pub(crate) fn new(id: AppletId, invocation: &Invocation) -> Result<Self, SetupError> {
        if invocation.program.as_os_str().is_empty() {
            return Err(SetupError::EmptyProgram);
        }

        let (stdin_tx, stdin_rx) = pipe::pipe().map_err(pipe_error("stdin"))?;
        let (stdout_tx, stdout_rx) = pipe::pipe().map_err(pipe_error("stdout"))?;

        let child_stdin = stdin_rx.into_blocking_fd().map_err(pipe_error("stdin"))?;
        let child_stdout = stdout_tx.into_blocking_fd().map_err(pipe_error("stdout"))?;

        let mut command = invocation.to_command();
        command
            .stdin(Stdio::from(child_stdin))
            .stdout(Stdio::from(child_stdout))
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        tracing::debug!(applet_id = %id, %invocation, "Allocated applet pipes");

        Ok(Self {
            id,
            program: invocation.program.display().to_string(),
            command: Some(command),
            child: None,
            stdin: Some(FramedWrite::new(stdin_tx, JsonStreamCodec::new())),
            stdout: Some(stdout_rx),
        })
    }

    /// Hand the output stream to its single reader.
    pub(crate) fn take_stdout(&mut self) -> Option<pipe::Receiver> {
        self.stdout.take()
    }

    /// Launch the OS process. Succeeds at most once per handle.
    pub(crate) fn spawn(&mut self) -> Result<Option<u32>, ProcessStartError> {
        let mut command = self
            .command
            .take()
            .ok_or(ProcessStartError::AlreadyStarted)?;

        let result = command.spawn();
        // Close the parent's copies of the child's pipe ends.
        drop(command);

        let child = result.map_err(|source| ProcessStartError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        self.child = Some(child);
        Ok(pid)
    }

    /// Write one message to the applet's stdin.
    pub(crate) async fn send(&mut self, message: AppletMessage) -> Result<(), ProtocolError> {
        match self.stdin.as_mut() {
            Some(writer) => writer.send(message).await,
            None => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "applet stdin closed",
            ))),
        }
    }

    /// Close stdin. Returns false if it was already closed.
    pub(crate) fn close_stdin(&mut self) -> bool {
        match self.stdin.take() {
            Some(writer) => {
                drop(writer);
                tracing::debug!(applet_id = %self.id, "Closed applet stdin");
                true
            }
            None => false,
        }
    }

    /// Wait for the process to exit and reclaim it.
    ///
    /// With a `stop_timeout` the process gets SIGTERM once the timeout passes,
    /// then SIGKILL after `kill_grace`. Returns `None` if the process was never
    /// spawned, was already reaped, or could not be waited on.
    pub(crate) async fn reap(
        &mut self,
        stop_timeout: Option<Duration>,
        kill_grace: Duration,
    ) -> Option<ExitStatus> {
        let mut child = self.child.take()?;

        let status = match stop_timeout {
            None => child.wait().await,
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(
                        applet_id = %self.id,
                        timeout_secs = timeout.as_secs_f64(),
                        "Applet did not exit after stdin closed, sending SIGTERM"
                    );
                    terminate(&mut child);
                    match tokio::time::timeout(kill_grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            tracing::warn!(applet_id = %self.id, "Applet ignored SIGTERM, killing");
                            if let Err(e) = child.kill().await {
                                tracing::error!(applet_id = %self.id, error = %e, "Failed to kill applet");
                            }
                            child.wait().await
                        }
                    }
                }
            },
        };

        match status {
            Ok(status) => {
                tracing::debug!(applet_id = %self.id, %status, "Applet process reaped");
                Some(status)
            }
            Err(e) => {
                tracing::error!(applet_id = %self.id, error = %e, "Failed to wait for applet");
                None
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.child {
            tracing::warn!(applet_id = %self.id, "Applet process dropped without being reaped, killing");
            if let Err(e) = child.start_kill() {
                tracing::warn!(applet_id = %self.id, error = %e, "Failed to kill applet");
            }
        }
    }
}
