//! applet-host: supervision core for child applets.
//!
//! An applet is a child process that talks to its parent over stdin/stdout
//! using a stream of self-delimiting JSON messages (`{"kind": ..., "data": {...}}`).
//! The core launches it, decodes its output into a [`Dispatcher`], tracks its
//! lifecycle, and guarantees the process is reaped exactly once however it
//! ends.
//!
//! Unix only: pipes are allocated up front with `tokio::net::unix::pipe`.

mod process;
mod state;
mod version;

pub mod applet;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod set;

pub use applet::{Applet, AppletError, AppletHandle};
pub use bridge::codec::{JsonStreamCodec, ProtocolError};
pub use bridge::protocol::{AppletId, AppletMessage};
pub use config::{AppletConfig, Invocation};
pub use dispatcher::{CoreDispatcher, Dispatcher, FnDispatcher};
pub use process::{ProcessStartError, SetupError};
pub use set::AppletSet;
pub use state::AppletState;
pub use version::APPLET_HOST_VERSION;
