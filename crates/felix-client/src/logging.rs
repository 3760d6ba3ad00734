//! Logging helpers.
//!
//! The runtime logs through `tracing`; binaries and tests opt in to a
//! subscriber with [`init`].  [`fatal`] is reserved for unrecoverable
//! conditions (startup failure, a dead heart-beat loop): it flushes a
//! one-line marker and aborts the process with exit code 1.

use tracing::error;
use tracing_subscriber::EnvFilter;

/// Install the default fmt subscriber with `RUST_LOG`-style filtering.
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Log at FATAL severity and abort the process.
pub fn fatal(message: &str) -> ! {
    error!(fatal = true, "{message}");
    eprintln!("FATAL: {message}");
    std::process::exit(1);
}
