//! Read task - decodes applet output and hands each message to the dispatcher.

use std::sync::Arc;

use futures::StreamExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use super::AppletHandle;
use super::signal::StopSignal;
use crate::bridge::codec::{JsonStreamCodec, ProtocolError};
use crate::bridge::protocol::AppletMessage;
use crate::dispatcher::Dispatcher;

/// The error that ended the read task.
#[derive(Debug)]
pub(super) struct ReadFault {
    pub(super) error: ProtocolError,
    /// A stop had been requested when the error was read.
    pub(super) stop_requested: bool,
}

impl ReadFault {
    fn new(error: ProtocolError, stop: &StopSignal) -> Self {
        Self {
            error,
            stop_requested: stop.was_requested(),
        }
    }
}

/// Sole reader of the applet's stdout. Never writes stdin or touches state;
/// a decode failure or end of stream is reported to the manager and ends the
/// task. A dispatcher panic ends it without a report, which the manager sees
/// as the error channel closing.
pub(super) async fn run(
    applet: AppletHandle,
    stdout: pipe::Receiver,
    dispatcher: Arc<dyn Dispatcher>,
    errors: mpsc::Sender<ReadFault>,
) {
    let id = applet.id();
    let stop = applet.stop.clone();
    let mut reader = FramedRead::new(stdout, JsonStreamCodec::<AppletMessage>::new());
    let mut dispatched: u64 = 0;

    loop {
        if stop.is_raised() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = stop.raised() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                tracing::trace!(applet_id = %id, kind = %message.kind, "Dispatching applet message");
                dispatcher.dispatch(&applet, message).await;
                dispatched += 1;
            }
            Some(Err(e)) => {
                tracing::warn!(applet_id = %id, error = %e, "Applet output error");
                let _ = errors.send(ReadFault::new(e, &stop)).await;
                break;
            }
            None => {
                tracing::debug!(applet_id = %id, "Applet closed its output");
                let _ = errors
                    .send(ReadFault::new(ProtocolError::EndOfStream, &stop))
                    .await;
                break;
            }
        }
    }

    tracing::debug!(applet_id = %id, dispatched, "Read task exiting");
}
