//! Configuration schema definitions.
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "pretty"
//!
//! [logging.filters]
//! trooba_core = "trace"
//!
//! [pipeline]
//! validate = ["request"]
//! unmatched = "warn"
//! fault = "log"
//!
//! [pipeline.attributes]
//! service = "checkout"
//!
//! [stages.retry]
//! attempts = 3
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trooba_core::{Context, FaultPolicy, UnmatchedPolicy};

use super::error::{ConfigError, ConfigResult};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TroobaConfig {
    /// Logging setup.
    pub logging: LoggingConfig,

    /// Routing policies of created chains.
    pub pipeline: PipelineSettings,

    /// Per-stage configuration sections, keyed by plugin name.
    pub stages: HashMap<String, Value>,
}

impl TroobaConfig {
    /// Returns the raw section of a stage, `null` when absent.
    pub fn stage_config(&self, name: &str) -> Value {
        self.stages.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Deserializes the section of a stage.
    ///
    /// An absent section reads as an empty object.
    pub fn stage<T: DeserializeOwned>(&self, name: &str) -> ConfigResult<T> {
        let section = match self.stages.get(name) {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(value) => value.clone(),
        };
        serde_json::from_value(section).map_err(|source| ConfigError::Stage {
            stage: name.to_string(),
            source,
        })
    }

    /// Builds a chain context from the pipeline settings.
    pub fn context(&self) -> Context {
        self.pipeline.to_context()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Routing policies applied to every chain created from this configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Message kinds that must find a consumer.
    pub validate: Vec<String>,

    /// Policy for unvalidated messages that find no consumer.
    pub unmatched: UnmatchedPolicy,

    /// How an error with no consumer surfaces.
    pub fault: FaultMode,

    /// Initial context attributes.
    pub attributes: Map<String, Value>,
}

impl PipelineSettings {
    /// Builds a chain context.
    pub fn to_context(&self) -> Context {
        let mut context = Context::new()
            .unmatched(self.unmatched)
            .fault(self.fault.to_policy());
        for kind in &self.validate {
            context = context.validate(kind.as_str());
        }
        for (key, value) in &self.attributes {
            context = context.attribute(key.as_str(), value.clone());
        }
        context
    }
}

/// Configurable subset of the core fault policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultMode {
    /// Abort the process.
    #[default]
    Abort,
    /// Panic the task that exhausted the chain.
    Panic,
    /// Only log the error.
    Log,
}

impl FaultMode {
    /// Converts to the core fault policy.
    pub fn to_policy(self) -> FaultPolicy {
        match self {
            Self::Panic => FaultPolicy::Panic,
            Self::Abort => FaultPolicy::Abort,
            // Already logged at error level by the chain.
            Self::Log => FaultPolicy::hook(|_| {}),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level.
    pub level: LogLevel,

    /// Output format.
    pub format: LogFormat,

    /// Output destination.
    pub output: LogOutput,

    /// Span lifecycle events to log.
    pub span_events: SpanEventConfig,

    /// Include thread IDs.
    pub thread_ids: bool,

    /// Include file names and line numbers.
    pub file_location: bool,

    /// Log file path, required for `output = "file"`.
    pub file_path: Option<PathBuf>,

    /// Rotation of the log file.
    pub rotation: LogRotation,

    /// Rotated files to keep; `0` keeps all of them.
    pub max_files: usize,

    /// Per-target levels, e.g. `trooba_core = "trace"`.
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            rotation: LogRotation::Never,
            max_files: 5,
            filters: HashMap::new(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the level as a filter directive string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Converts to a `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature.
    Json,
}

/// Log output destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Log file rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

/// Span lifecycle events to log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}
