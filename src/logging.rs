//! Tracing subscriber setup for binaries that embed this crate.
//!
//! The library itself never installs a subscriber -- it only emits
//! `tracing` events -- so that embedding applications keep control of where
//! logs go. This module is a convenience for `keyspan-inspect` and for
//! tests that want readable output.

use tracing_subscriber::EnvFilter;

/// Initialize a default `tracing-subscriber` with `RUST_LOG` support.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
