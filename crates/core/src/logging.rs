//! Structured logging for the provisioning station.
//!
//! Operators read the human format at the bench; the JSON format is meant
//! for collecting station logs alongside the provisioning database.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize human-readable logging on stderr.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use keyburn_core::logging;
///
/// logging::init();
/// tracing::info!("Station ready");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

/// Initialize JSON logging on stderr.
///
/// # Example
/// ```no_run
/// use keyburn_core::logging;
///
/// logging::init_json();
/// tracing::info!(station = "line-2", "Station ready");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
        .init();
}
