//! Stdio bridge between the parent and an applet.
//!
//! # Architecture
//!
//! - **protocol**: Message types (AppletMessage) and applet identifiers
//! - **codec**: self-delimiting JSON codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
