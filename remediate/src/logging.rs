//! Development-time tracing.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. It is not part of
//! the product output: cycle journals and notifications under `.remediate/`
//! are always written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `default_filter` when unset.
///
/// # Example
/// ```bash
/// RUST_LOG=remediate=debug remediate fix src/app.ts
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
