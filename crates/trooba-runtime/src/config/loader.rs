//! Configuration loader using figment.
//!
//! # Feature Flags
//!
//! - `toml-config` *(default)*: searches `trooba.toml`
//! - `yaml-config`: searches `trooba.yaml` and `trooba.yml`
//!
//! # Configuration Priority (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Programmatic merges ([`ConfigLoader::merge`])
//! 3. Profile-specific file (`trooba.{profile}.toml`)
//! 4. Main file (`trooba.toml`)
//! 5. Environment variables (`TROOBA_*`)
//!
//! # Environment Variable Mapping
//!
//! Variables use the `TROOBA_` prefix with `__` as the nesting separator:
//!
//! - `TROOBA_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `TROOBA_PIPELINE__UNMATCHED=warn` → `pipeline.unmatched = "warn"`
//! - `TROOBA_STAGES__RETRY__ATTEMPTS=3` → `stages.retry.attempts = 3`
//!
//! # Example
//!
//! ```rust,ignore
//! use trooba_runtime::config::ConfigLoader;
//!
//! let config = ConfigLoader::new().profile("production").load()?;
//! let pipe = pipeline.create_with(config.context())?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "toml-config", feature = "yaml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace};

use super::error::{ConfigError, ConfigResult};
use super::schema::TroobaConfig;

/// Prefix of every environment variable read by the loader.
pub const ENV_PREFIX: &str = "TROOBA_";

/// Base name of configuration files.
pub const FILE_STEM: &str = "trooba";

/// Configuration profile for environment-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    /// Development profile (default).
    #[default]
    Development,
    /// Production profile.
    Production,
    /// Custom profile name.
    Custom(String),
}

impl Profile {
    /// Parses a profile name; `prod` and `dev` are accepted as aliases.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Returns the profile name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Reads `TROOBA_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var(format!("{ENV_PREFIX}PROFILE"))
            .map(|name| Self::parse(&name))
            .unwrap_or_default()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multi-source configuration loader.
pub struct ConfigLoader {
    figment: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a loader with the profile taken from the environment.
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    /// Sets the configuration profile.
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Adds a directory to search for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Loads exactly this file instead of searching.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Enables environment variables (default).
    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Disables environment variables.
    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges configuration programmatically, below files and environment.
    pub fn merge(mut self, config: TroobaConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    /// Loads the configuration.
    pub fn load(self) -> ConfigResult<TroobaConfig> {
        let profile = self.profile.clone();
        let config: TroobaConfig = self.build_figment()?.extract()?;
        debug!(
            profile = %profile,
            logging_level = %config.logging.level,
            stages = config.stages.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(TroobaConfig::default()))
            .merge(std::mem::take(&mut self.figment));

        match self.config_file.take() {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading configuration file");
                figment = merge_file(figment, &path)?;
            }
            Some(path) => return Err(ConfigError::FileNotFound(path)),
            None => figment = self.search_files(figment)?,
        }

        if self.load_env {
            trace!(prefix = ENV_PREFIX, "Loading environment variables");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment)
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join(FILE_STEM));
        }
        paths
    }

    /// Merges the profile file then the main file of the first directory
    /// holding a main file.
    fn search_files(&self, mut figment: Figment) -> ConfigResult<Figment> {
        for dir in self.resolve_search_paths() {
            for ext in enabled_extensions() {
                let main = dir.join(format!("{FILE_STEM}.{ext}"));
                if !main.exists() {
                    continue;
                }
                let profiled = dir.join(format!("{FILE_STEM}.{}.{ext}", self.profile));
                if profiled.exists() {
                    debug!(path = %profiled.display(), "Loading profile configuration");
                    figment = merge_file(figment, &profiled)?;
                }
                info!(path = %main.display(), "Loading configuration file");
                return merge_file(figment, &main);
            }
        }
        debug!("No configuration file found, using defaults");
        Ok(figment)
    }
}

fn enabled_extensions() -> Vec<&'static str> {
    let mut exts = Vec::new();
    #[cfg(feature = "toml-config")]
    exts.push("toml");
    #[cfg(feature = "yaml-config")]
    exts.extend(["yaml", "yml"]);
    exts
}

fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Loads configuration from the default locations.
pub fn load_config() -> ConfigResult<TroobaConfig> {
    ConfigLoader::new().load()
}

/// Loads configuration from one file plus the environment.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<TroobaConfig> {
    ConfigLoader::new().file(path).load()
}
