//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for structured logging. Supports
//! config-driven log levels, environment variable overrides, and format
//! switching between pretty (debug) and JSON (release).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for `log_level`, applied to the engine crate as well
fn default_filter(log_level: &str) -> String {
    format!("{},colgen_engine={}", log_level, log_level)
}

/// Initialize the tracing subscriber with the given log level from config.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter > default "info".
/// Only the first successful call installs a subscriber.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    }
}

/// Initialize the tracing subscriber at "info" unless `RUST_LOG` says otherwise
pub fn init_telemetry() {
    init_telemetry_with_level("info");
}
