//! Invocation descriptor and supervision settings.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// How to launch an applet: program plus optional arguments, environment
/// overrides and working directory. Everything not set is inherited from the
/// parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Build the OS command. Stdio is wired separately by the process handle.
    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(ref dir) = self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Supervision settings for a single applet.
#[derive(Debug, Clone)]
pub struct AppletConfig {
    /// How long to wait for the process to exit after its stdin is closed.
    /// `None` waits forever.
    pub stop_timeout: Option<Duration>,
    /// Extra wait after SIGTERM before the process is killed outright.
    pub kill_grace: Duration,
    /// Capacity of the outbound message queue.
    pub outbound_capacity: usize,
}

impl Default for AppletConfig {
    fn default() -> Self {
        Self {
            stop_timeout: None,
            kill_grace: Duration::from_secs(5),
            outbound_capacity: 64,
        }
    }
}

impl AppletConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }
}
