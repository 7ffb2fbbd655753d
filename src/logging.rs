//! Tracing subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber.
///
/// `local` gets human-readable output at debug level; any other environment
/// gets JSON lines at info. `RUST_LOG` overrides the level either way.
/// Calling it twice is harmless.
pub fn init(app_env: &str) {
    let local = app_env == "local";
    let default_level = if local { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if local {
        registry.with(fmt::layer().with_target(false)).try_init()
    } else {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
