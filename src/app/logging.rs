//! Diagnostic logging to stderr

use std::io;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives for the relay's own diagnostics
pub const LOG_ENV: &str = "PTY_RELAY_LOG";

/// Install the global subscriber.
///
/// Diagnostics go to stderr so they never mix with relayed output. Calling
/// this twice is harmless; the second subscriber is discarded.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).with_target(false))
        .try_init();
}
