//! Tracing subscriber setup.

use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies.
/// Safe to call more than once — later calls are no-ops, which keeps
/// test binaries from panicking on double init.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
    debug!(default_filter, "tracing initialized");
}
