//! Configuration validation.

use std::collections::HashSet;

use trooba_core::kinds;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, PipelineSettings, TroobaConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &TroobaConfig) -> ConfigResult<()> {
    validate_logging(&config.logging)?;
    validate_pipeline(&config.pipeline)?;
    validate_stages(config)?;
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    for target in logging.filters.keys() {
        if target.is_empty() || target.contains(char::is_whitespace) {
            return Err(ConfigError::validation(format!(
                "Invalid log filter target: '{target}'"
            )));
        }
    }
    Ok(())
}

fn validate_pipeline(pipeline: &PipelineSettings) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for kind in &pipeline.validate {
        if kind.is_empty() || kind.contains(char::is_whitespace) {
            return Err(ConfigError::validation(format!(
                "Invalid message kind in pipeline.validate: '{kind}'"
            )));
        }
        // Errors and traces never reach the missing-consumer check.
        if kind == kinds::ERROR || kind == kinds::TRACE || kind == kinds::WILDCARD {
            return Err(ConfigError::validation(format!(
                "Message kind '{kind}' cannot be validated"
            )));
        }
        if !seen.insert(kind) {
            return Err(ConfigError::validation(format!(
                "Duplicate message kind in pipeline.validate: '{kind}'"
            )));
        }
    }
    Ok(())
}

fn validate_stages(config: &TroobaConfig) -> ConfigResult<()> {
    for (name, section) in &config.stages {
        if name.is_empty() {
            return Err(ConfigError::validation("Stage name cannot be empty"));
        }
        if !(section.is_object() || section.is_null()) {
            return Err(ConfigError::validation(format!(
                "Configuration of stage '{name}' must be a table"
            )));
        }
    }
    Ok(())
}
