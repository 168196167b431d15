//! Dispatcher contract for inbound applet messages.
//!
//! The core only defines the seam. Routing tables that map message kinds to
//! behavior live with the embedding application.

use async_trait::async_trait;

use crate::applet::AppletHandle;
use crate::bridge::protocol::AppletMessage;

/// Receives every message an applet writes, in write order, one at a time.
///
/// Dispatch runs on the applet's read task: while it is pending, no further
/// messages are decoded and stop signals are not observed by the reader.
/// Implementations must not block indefinitely. Lifecycle changes go through
/// the handle's hooks ([`AppletHandle::mark_running`],
/// [`AppletHandle::mark_failed`]), never by mutating state directly.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, applet: &AppletHandle, message: AppletMessage);
}

/// Default dispatcher: logs each message and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreDispatcher;

#[async_trait]
impl Dispatcher for CoreDispatcher {
    async fn dispatch(&self, applet: &AppletHandle, message: AppletMessage) {
        tracing::info!(
            target: "applet_host::dispatch",
            applet_id = %applet.id(),
            kind = %message.kind,
            data = %serde_json::Value::Object(message.data),
            "Applet message"
        );
    }
}

/// Dispatcher backed by a synchronous closure.
pub struct FnDispatcher<F> {
    f: F,
}

impl<F> FnDispatcher<F>
where
    F: Fn(&AppletHandle, AppletMessage) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Dispatcher for FnDispatcher<F>
where
    F: Fn(&AppletHandle, AppletMessage) + Send + Sync + 'static,
{
    async fn dispatch(&self, applet: &AppletHandle, message: AppletMessage) {
        (self.f)(applet, message)
    }
}
