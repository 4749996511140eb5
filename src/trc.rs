//! Tracing configuration and initialization.
//!
//! Deferred-operation failures are only ever reported through the log, so
//! the subscriber writes to standard error (never stdout, which belongs to
//! whatever the operator piped the mount through) and is installed before
//! anything can be queued.

use std::io::IsTerminal as _;

use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Environment variable overriding the default `info` filter.
pub const LOG_ENV: &str = "HASTEFS_LOG";

/// Install the global subscriber.
pub fn init() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
}
