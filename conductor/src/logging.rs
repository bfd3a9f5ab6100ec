//! Development-time tracing.
//!
//! Tracing is diagnostics only. Lock files, the history log, and executor
//! output logs are product records and are written regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber for the `conductor` CLI.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output goes to stderr in compact
/// format so stdout stays parseable.
///
/// # Example
/// ```bash
/// RUST_LOG=conductor=debug conductor locks list
/// ```
pub fn init() {
    init_with_default("warn");
}

/// Like [`init`] with a caller-chosen default filter.
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
