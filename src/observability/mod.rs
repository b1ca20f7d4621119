//! Structured logging setup
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the application. `init_logging` is the stock choice: a fmt layer with
//! an `EnvFilter`, in text or JSON form.

pub mod config;

pub use config::{LogFormat, LoggingConfig};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a global subscriber in the given format, filtered by `RUST_LOG`
///
/// Returns an error if a global subscriber is already set.
pub fn init_logging(format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    init_with(&LoggingConfig {
        format,
        ..LoggingConfig::default()
    })
}

/// Install a global subscriber configured from the environment
pub fn init_from_env() -> Result<(), tracing_subscriber::util::TryInitError> {
    init_with(&LoggingConfig::from_env())
}

pub fn init_with(config: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directives));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target)
                    .with_current_span(true),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(config.with_target),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init(),
    }
}
