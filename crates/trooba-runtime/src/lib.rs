//! Trooba Runtime - hosting support for Trooba pipelines.
//!
//! This crate provides:
//! - Layered configuration (`ConfigLoader`): defaults, files, environment
//! - Chain policies from configuration (`TroobaConfig::context`)
//! - Per-stage configuration sections (`TroobaConfig::stage`)
//! - Logging setup (`LoggingBuilder`)
//!
//! ```ignore
//! use trooba_runtime::config::{load_config, validate_config};
//!
//! let config = load_config()?;
//! validate_config(&config)?;
//! trooba_runtime::logging::init_from_config(&config.logging);
//!
//! let pipeline = Trooba::new()
//!     .use_plugin(Retry, config.stage_config("retry"))?
//!     .use_fn(terminal)
//!     .build();
//! let pipe = pipeline.create_with(config.context())?;
//! ```

pub mod config;
pub mod logging;

// Re-exports
pub use config::{
    ConfigError, ConfigLoader, ConfigResult, PipelineSettings, Profile, TroobaConfig, load_config,
    load_config_from_file, validate_config,
};
pub use logging::{LoggingBuilder, LoggingError, SpanEvents, init_from_config};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros: `trace!`, `debug!`, `info!`, `warn!`, `error!`, `span`,
/// `event`, `instrument` and `Level`.
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
