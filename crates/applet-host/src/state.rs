//! Applet lifecycle states.

use serde::{Deserialize, Serialize};

/// Current known or expected state of an applet.
///
/// States advance in declaration order. `Failed` is the one state that may
/// move back to `Running`: the applet reported an application-level failure
/// but its process is still alive and may recover. `Crashed` and `Stopped`
/// are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppletState {
    /// Not yet registered.
    #[default]
    Uninitialized,
    /// Registered, pipes allocated, not started.
    Registered,
    /// Process launched, no readiness signal yet.
    Started,
    /// Applet reported ready.
    Running,
    /// Applet reported a failure but is still running.
    Failed,
    /// Process exited without being asked to.
    Crashed,
    /// Process was asked to stop (or was killed).
    Stopped,
}

impl AppletState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Crashed | Self::Stopped)
    }

    /// True while the OS process may be alive.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Started | Self::Running | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Registered => "registered",
            Self::Started => "started",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: AppletState) -> bool {
        use AppletState::*;
        match (*self, next) {
            (Uninitialized, Registered) => true,
            (Registered, Started) => true,
            (Started | Failed, Running) => true,
            (Running, Failed) => true,
            // Stop is accepted from any non-terminal state.
            (from, Stopped) => !from.is_terminal(),
            (Started | Running | Failed, Crashed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AppletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
