//! Utilities for initializing logging.

use tracing_subscriber::EnvFilter;

/// Initialize a global tracing subscriber.
///
/// Filter defaults to `info`, overridable with `RUST_LOG`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Initialize logging for tests.
///
/// Safe to call from multiple tests; only the first call installs the
/// subscriber.
pub fn try_init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
