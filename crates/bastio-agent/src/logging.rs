//! Logging setup.
//!
//! In `--debug` mode events go to stderr as compact colored lines at DEBUG.
//! Otherwise the agent emits JSON lines at INFO, which syslog/journald
//! collectors ingest with structure intact. `RUST_LOG` overrides either
//! default filter.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Panics if called twice.
pub fn init(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if debug {
        builder.compact().with_ansi(true).init();
    } else {
        builder.json().flatten_event(true).with_ansi(false).init();
    }
}
