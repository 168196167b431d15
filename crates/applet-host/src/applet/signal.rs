//! Idempotent broadcast stop signal shared by an applet's tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Single-fire stop signal.
///
/// Two trigger sites feed it: an explicit stop request from a caller, and an
/// internal raise by the manager task after an I/O error. Both are safe to
/// call any number of times. The signal records whether a caller asked for
/// the stop so teardown can tell `Stopped` from `Crashed`.
#[derive(Clone, Default)]
pub(crate) struct StopSignal {
    token: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Caller-initiated stop. Returns true only for the first request.
    pub(crate) fn request(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    /// Internal stop, raised on error. Does not count as a request.
    pub(crate) fn raise(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn was_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub(crate) async fn raised(&self) {
        self.token.cancelled().await;
    }
}
