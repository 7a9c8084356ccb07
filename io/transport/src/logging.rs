//! Subscriber setup for processes embedding the transport.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter {directives:?}: {source}")]
    Filter {
        directives: String,
        source: ParseError,
    },
    #[error("global subscriber already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Filter from `RUST_LOG` when it is set and valid, else from the
/// configured level.
pub fn filter(level: &str, env: Option<&str>) -> Result<EnvFilter, LoggingError> {
    if let Some(filter) = env.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|source| LoggingError::Filter {
        directives: level.to_string(),
        source,
    })
}

/// Install the global subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let registry = tracing_subscriber::registry().with(filter(&config.level, env.as_deref())?);
    match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init()?,
    }
    Ok(())
}

/// Subscriber for tests: output goes through the test harness and only
/// appears when `RUST_LOG` is set. Safe to call more than once.
pub fn init_for_tests() {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let Ok(filter) = filter("off", env.as_deref()) else {
        return;
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
