//! Configuration for applications hosting Trooba pipelines.
//!
//! Loads logging setup, chain routing policies and per-stage sections from
//! files and the environment, and validates them.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    FaultMode, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, PipelineSettings,
    SpanEventConfig, TroobaConfig,
};
pub use validation::validate_config;
