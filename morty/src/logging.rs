//! Tracing setup for the morty binary.
//!
//! Diagnostics go to stderr and are not persisted. Agent output is written
//! separately to `.morty/logs/` regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable consulted when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "MORTY_LOG";

/// Initialize the tracing subscriber.
///
/// Filter precedence: `RUST_LOG`, then `MORTY_LOG`, then `fallback` (the
/// configured `logging.level`). Invalid directives fall through to `warn`.
///
/// # Example
/// ```bash
/// RUST_LOG=morty=debug morty doing
/// ```
pub fn init(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_ENV))
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second init (tests, repeated calls) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
