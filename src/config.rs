//! Configuration loading
//!
//! Settings come from a TOML file with environment variable overrides. Every field has a
//! default, so an empty file (or no file at all, via [`CallguardConfig::from_env`]) is a
//! valid configuration.

use std::path::Path;

use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

use crate::error::INTERNAL_SERVER_MESSAGE;
use crate::logging::{LogLevel, LoggingConfig};

/// Prefix of environment overrides, e.g. `CALLGUARD__SERVER__ADDRESS`.
pub const ENV_PREFIX: &str = "CALLGUARD";

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration file path is invalid.
    #[error("invalid configuration path: {0}")]
    InvalidPath(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallguardConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub errors: ErrorSettings,
}

/// Listener and shutdown settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSettings {
    /// Socket address to listen on
    #[serde(default = "default_address")]
    pub address: String,
    /// Upper bound on how long in-flight calls may drain after a shutdown signal
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// Log subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default = "default_true")]
    pub target: bool,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            target: true,
            json: false,
        }
    }
}

impl From<&LoggingSettings> for LoggingConfig {
    fn from(settings: &LoggingSettings) -> Self {
        LoggingConfig::new()
            .with_level(settings.level)
            .with_timestamps(settings.timestamps)
            .with_target(settings.target)
            .with_json(settings.json)
    }
}

/// Error interceptor settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorSettings {
    /// Message sent to callers for masked failures; defaults to "internal server error"
    #[serde(default)]
    pub internal_message: Option<String>,
    /// Whether a backtrace is captured for recovered panics
    #[serde(default = "default_true")]
    pub capture_backtrace: bool,
}

impl Default for ErrorSettings {
    fn default() -> Self {
        Self {
            internal_message: None,
            capture_backtrace: true,
        }
    }
}

impl ErrorSettings {
    /// The message callers see for masked failures.
    pub fn internal_message(&self) -> &str {
        match self.internal_message.as_deref() {
            Some(message) if !message.trim().is_empty() => message,
            _ => INTERNAL_SERVER_MESSAGE,
        }
    }
}

fn default_true() -> bool {
    true
}

impl CallguardConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables override file values using the format
    /// `CALLGUARD__<SECTION>__<KEY>` (e.g. `CALLGUARD__SERVER__SHUTDOWN_TIMEOUT_SECS=5`).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration file does not exist
    /// - The configuration file cannot be parsed
    /// - The path is invalid
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use callguard::config::CallguardConfig;
    ///
    /// let config = CallguardConfig::load("callguard.toml")?;
    /// # Ok::<(), callguard::config::ConfigError>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let path_str = path
            .to_str()
            .ok_or_else(|| ConfigError::InvalidPath(format!("{:?}", path)))?;

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path_str.to_string()));
        }

        let config = Config::builder()
            .add_source(File::new(path_str, FileFormat::Toml))
            .add_source(env_source())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(env_source()).build()?;
        Ok(config.try_deserialize()?)
    }

    /// Subscriber configuration derived from the logging section.
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from(&self.logging)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
