//! Version information for applet-host.

/// applet-host version from Cargo.toml
pub const APPLET_HOST_VERSION: &str = env!("CARGO_PKG_VERSION");
