//! Tracing setup for warden binaries.
//!
//! Diagnostics go to stderr via `RUST_LOG`. Per-cycle records are product
//! output and live in `.warden/history.jsonl`, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` (e.g. `"info"`) if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=warden=debug warden watch validator
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
