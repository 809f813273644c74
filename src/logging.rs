// SPDX-License-Identifier: MPL-2.0

//! Log output for embedding applications.
//!
//! The library only emits `tracing` events; an app that wants them printed
//! calls [`init`] once at startup.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "murmur=info";

/// Install a formatted stderr subscriber filtered by `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
