//! Process-wide tracing setup.
//!
//! Every binary and test harness calls [`init`] once at startup; library
//! crates only emit spans and events and never install subscribers.

use tracing_subscriber::EnvFilter;

/// Install the global JSON subscriber, filtered via `RUST_LOG`.
///
/// Safe to call multiple times; only the first call installs anything.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
