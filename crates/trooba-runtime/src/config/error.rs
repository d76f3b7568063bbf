//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// The file extension has no enabled format.
    #[error("Unsupported or disabled configuration format: .{0}")]
    UnsupportedFormat(String),

    /// The merged sources could not be extracted into the schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] Box<figment::Error>),

    /// A value is out of range or inconsistent with another one.
    #[error("Invalid configuration: {message}")]
    Validation { message: String },

    /// A required field is missing.
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// A stage section could not be deserialized.
    #[error("Invalid configuration for stage '{stage}': {source}")]
    Stage {
        stage: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Creates a validation error with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(Box::new(err))
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
