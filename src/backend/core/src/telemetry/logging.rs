//! Structured logging with JSON, pretty and compact formats.
//!
//! Debug and info events go to stdout, warnings and errors to stderr, so a
//! supervisor can separate the two streams without parsing.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::MakeWriterExt},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{LogFormat, LogLevel};

/// Logging settings taken from the loaded configuration.
#[derive(Debug, Clone, Copy)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

/// Build the filter: `RUST_LOG` wins when set, otherwise the configured level
/// applied to every target.
pub fn env_filter(level: LogLevel) -> anyhow::Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => Ok(EnvFilter::try_new(directives)?),
        _ => Ok(EnvFilter::try_new(level.as_str())?),
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if a subscriber is already installed or the filter
/// directives do not parse.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = env_filter(config.level)?;
    let writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);

    match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_file(false)
                .with_line_number(false)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer().compact().with_target(true).with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}
