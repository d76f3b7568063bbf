//! Logging setup over `tracing-subscriber`.
//!
//! The engine logs through `tracing` only: `debug` for stage materialization
//! and nested pipeline inlining, `trace` for every hop and continuation,
//! `warn` for dropped messages under the `warn` unmatched policy and `error`
//! for faults. This module installs a subscriber that renders them.
//!
//! # Configuration-Based Initialization
//!
//! ```rust,ignore
//! let config = trooba_runtime::config::load_config()?;
//! trooba_runtime::logging::init_from_config(&config.logging);
//! ```
//!
//! # Manual Initialization
//!
//! ```rust,ignore
//! use trooba_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! LoggingBuilder::new()
//!     .directive("trooba_core=trace")
//!     .span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LogOutput, LogRotation, LoggingConfig, SpanEventConfig};

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log file could not be opened.
    #[error("failed to open log file: {0}")]
    File(#[from] InitError),

    /// File output was requested without a path.
    #[error("file output requires a file path")]
    MissingFilePath,

    /// A global subscriber is already installed.
    #[error(transparent)]
    Init(#[from] TryInitError),
}

/// Span lifecycle events to log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    /// No span events.
    pub const NONE: Self = Self {
        new: false,
        enter: false,
        exit: false,
        close: false,
    };

    /// Span creation and close.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

    /// Every span event.
    pub const FULL: Self = Self {
        new: true,
        enter: true,
        exit: true,
        close: true,
    };

    fn to_fmt_span(self) -> fmt::format::FmtSpan {
        let mut span = fmt::format::FmtSpan::NONE;
        if self.new {
            span |= fmt::format::FmtSpan::NEW;
        }
        if self.enter {
            span |= fmt::format::FmtSpan::ENTER;
        }
        if self.exit {
            span |= fmt::format::FmtSpan::EXIT;
        }
        if self.close {
            span |= fmt::format::FmtSpan::CLOSE;
        }
        span
    }
}

impl From<&SpanEventConfig> for SpanEvents {
    fn from(config: &SpanEventConfig) -> Self {
        Self {
            new: config.new,
            enter: config.enter,
            exit: config.exit,
            close: config.close,
        }
    }
}

/// Initializes logging from a [`LoggingConfig`].
///
/// Does nothing if a global subscriber is already installed.
pub fn init_from_config(config: &LoggingConfig) {
    let _ = LoggingBuilder::from_config(config).try_init();
}

// =============================================================================
// LoggingBuilder
// =============================================================================

/// A builder for the global subscriber.
#[derive(Debug)]
pub struct LoggingBuilder {
    directives: Vec<String>,
    level: tracing::Level,
    span_events: SpanEvents,
    format: LogFormat,
    output: LogOutput,
    with_target: bool,
    with_thread_ids: bool,
    with_file: bool,
    with_line_number: bool,
    file_path: Option<PathBuf>,
    rotation: LogRotation,
    max_files: usize,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    /// Creates a builder logging compact lines at `info` to stdout.
    pub fn new() -> Self {
        Self {
            directives: Vec::new(),
            level: tracing::Level::INFO,
            span_events: SpanEvents::NONE,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
            file_path: None,
            rotation: LogRotation::Never,
            max_files: 0,
        }
    }

    /// Creates a builder from a [`LoggingConfig`].
    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut builder = Self::new()
            .with_level(config.level.to_tracing_level())
            .format(config.format)
            .output(config.output)
            .span_events(SpanEvents::from(&config.span_events))
            .with_thread_ids(config.thread_ids)
            .with_file(config.file_location)
            .with_line_number(config.file_location);
        builder.file_path.clone_from(&config.file_path);
        builder.rotation = config.rotation;
        builder.max_files = config.max_files;

        for (target, level) in &config.filters {
            builder = builder.directive(&format!("{target}={level}"));
        }
        builder
    }

    /// Sets the global log level.
    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = level;
        self
    }

    /// Adds a filter directive such as `trooba_core=trace`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    /// Sets the span events to log.
    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    /// Sets the output format.
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the output destination.
    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Includes the target (module path).
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Includes thread IDs.
    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    /// Includes file names.
    pub fn with_file(mut self, enabled: bool) -> Self {
        self.with_file = enabled;
        self
    }

    /// Includes line numbers.
    pub fn with_line_number(mut self, enabled: bool) -> Self {
        self.with_line_number = enabled;
        self
    }

    /// Writes to this file; switches the output to [`LogOutput::File`].
    pub fn file(mut self, path: impl Into<PathBuf>, rotation: LogRotation) -> Self {
        self.file_path = Some(path.into());
        self.rotation = rotation;
        self.output = LogOutput::File;
        self
    }

    /// Keeps at most `count` rotated files; `0` keeps all of them.
    pub fn max_files(mut self, count: usize) -> Self {
        self.max_files = count;
        self
    }

    /// Builds the filter. `RUST_LOG` replaces the base level when set.
    fn build_filter(&self) -> EnvFilter {
        let base = self.level.to_string().to_lowercase();
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base));
        for directive in &self.directives {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        filter
    }

    fn file_appender(&self) -> Result<RollingFileAppender, LoggingError> {
        let path = self.file_path.as_ref().ok_or(LoggingError::MissingFilePath)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("trooba.log");

        let rotation = match self.rotation {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
        };
        let mut builder = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(name);
        if self.max_files > 0 {
            builder = builder.max_log_files(self.max_files);
        }
        Ok(builder.build(dir)?)
    }

    /// Installs the subscriber, ignoring failures.
    pub fn init(self) {
        let _ = self.try_init();
    }

    /// Installs the subscriber.
    pub fn try_init(self) -> Result<(), LoggingError> {
        let filter = self.build_filter();
        let span_events = self.span_events.to_fmt_span();

        macro_rules! configure_layer {
            ($layer:expr) => {
                $layer
                    .with_span_events(span_events)
                    .with_target(self.with_target)
                    .with_thread_ids(self.with_thread_ids)
                    .with_file(self.with_file)
                    .with_line_number(self.with_line_number)
            };
        }

        macro_rules! init_with_writer {
            ($writer:expr) => {
                match self.format {
                    #[cfg(feature = "json-log")]
                    LogFormat::Json => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().json().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    // Without the feature, JSON falls back to compact lines.
                    #[cfg(not(feature = "json-log"))]
                    LogFormat::Json => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().compact().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    LogFormat::Compact => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().compact().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    LogFormat::Full => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    LogFormat::Pretty => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().pretty().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                }
            };
        }

        match self.output {
            LogOutput::Stdout => init_with_writer!(std::io::stdout)?,
            LogOutput::Stderr => init_with_writer!(std::io::stderr)?,
            LogOutput::File => {
                let appender = self.file_appender()?;
                init_with_writer!(appender)?
            }
        }
        Ok(())
    }
}
