//! Common CLI flags for logging.

use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::ParseError,
    fmt::writer::BoxMakeWriter,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// The filter used when neither `--log-filter` nor `-v` is given.
pub const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {source}")]
    InvalidFilter { filter: String, source: ParseError },

    #[error("failed to install the global subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogDestination {
    #[default]
    Stdout,
    Stderr,
}

/// How log lines are formatted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, single line.
    #[default]
    Full,
    /// Human-readable, multi line.
    Pretty,
    /// Machine-parseable.
    Json,
    /// Human-readable, shortened single line.
    Compact,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `info,tablestore_writer=debug` specifies debug logging for the
    /// writer and info for everything else.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug'
    ///
    /// -vvv 'trace'
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub log_verbose_count: u8,

    /// Logs: destination
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value_t = LogDestination::default(),
        value_enum,
        action
    )]
    pub log_destination: LogDestination,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value_t = LogFormat::default(),
        value_enum,
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    /// The filter directive in effect, after `-v` is applied.
    pub fn filter_directive(&self) -> &str {
        match self.log_verbose_count {
            0 => self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER),
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        let filter = self.filter_directive();
        EnvFilter::try_new(filter).map_err(|source| LoggingError::InvalidFilter {
            filter: filter.to_string(),
            source,
        })
    }

    /// Install a global `tracing` subscriber built from this config.
    pub fn install_global_subscriber(&self) -> Result<(), LoggingError> {
        let filter = self.env_filter()?;

        let writer = match self.log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        };
        let fmt = tracing_subscriber::fmt::layer().with_writer(writer);
        let layer: Box<dyn Layer<Registry> + Send + Sync> = match self.log_format {
            LogFormat::Full => fmt.boxed(),
            LogFormat::Pretty => fmt.pretty().boxed(),
            LogFormat::Json => fmt.json().boxed(),
            LogFormat::Compact => fmt.compact().boxed(),
        };

        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .try_init()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::Parser;

    use super::*;

    #[test]
    fn test_verbose_overrides_filter() {
        let config = LoggingConfig::parse_from(["log", "--log-filter", "error"]);
        assert_eq!(config.filter_directive(), "error");

        let config = LoggingConfig::parse_from(["log", "--log-filter", "error", "-v"]);
        assert_eq!(config.filter_directive(), "info");

        let config = LoggingConfig::parse_from(["log", "-vv"]);
        assert_eq!(config.filter_directive(), "debug");

        let config = LoggingConfig::parse_from(["log", "-vvvv"]);
        assert_eq!(config.filter_directive(), "trace");
    }

    #[test]
    fn test_format_and_destination() {
        let config =
            LoggingConfig::parse_from(["log", "--log-format", "json", "--log-destination", "stderr"]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_destination, LogDestination::Stderr);
    }

    #[test]
    fn test_invalid_filter() {
        let config = LoggingConfig::parse_from(["log", "--log-filter", "tablestore_writer=loud"]);
        assert_matches!(
            config.env_filter(),
            Err(LoggingError::InvalidFilter { filter, .. }) if filter == "tablestore_writer=loud"
        );
    }

    #[test]
    fn test_install_global_subscriber() {
        let config = LoggingConfig::parse_from(["log", "-v", "--log-format", "compact"]);
        // Only one global subscriber may be installed per process.
        match config.install_global_subscriber() {
            Ok(()) => tracing::info!("subscriber installed"),
            Err(e) => assert_matches!(e, LoggingError::Install(_)),
        }
    }
}
