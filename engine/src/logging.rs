//! Stderr diagnostics for batch runs.
//!
//! Tracing output is for whoever is watching a run and is never persisted.
//! Everything a later `bench report` needs goes through `io/recorder`
//! instead, regardless of the active filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set and parseable; otherwise `default_level` applies.
///
/// ```bash
/// RUST_LOG=engine::agent=debug bench run --tasks tasks --logs logs
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
