//! Logging for the server and its interceptors
//!
//! Two separate concerns live here:
//! - installing the process-wide `tracing` subscriber, filtered by `RUST_LOG` or by the
//!   configured level, as plain text or JSON on stderr
//! - the [`LogSink`] capability each interceptor is constructed with, so interceptors never
//!   reach for global state themselves

pub mod sink;

use serde::Deserialize;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

pub use sink::{LogLine, LogSink, MemorySink, TracingSink};

/// Transport crates that are chatty at debug level; they stay at `warn` unless `RUST_LOG`
/// says otherwise.
const TRANSPORT_TARGETS: [&str; 3] = ["h2", "hyper", "tower"];

/// Severity of a log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Nothing is written
    Off,
}

impl LogLevel {
    /// Returns the filter directive for this level.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }

    /// Returns the matching `tracing` level, or `None` for [`LogLevel::Off`].
    pub fn as_tracing(self) -> Option<Level> {
        match self {
            LogLevel::Trace => Some(Level::TRACE),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Off => None,
        }
    }
}

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// A global subscriber was already installed.
    #[error("failed to install log subscriber: {0}")]
    AlreadyInitialized(String),
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Prefix every line with a timestamp
    pub timestamps: bool,
    /// Include the module path of the call site
    pub target: bool,
    pub thread_ids: bool,
    /// One JSON object per event instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            target: true,
            thread_ids: false,
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.thread_ids = enabled;
        self
    }

    pub fn with_json(mut self, enabled: bool) -> Self {
        self.json = enabled;
        self
    }

    /// Filter used when `RUST_LOG` is not set.
    pub fn directive(&self) -> String {
        let level = self.level.as_directive();
        if self.level == LogLevel::Off {
            return level.to_string();
        }
        let mut directive = level.to_string();
        for target in TRANSPORT_TARGETS {
            directive.push_str(&format!(",{target}=warn"));
        }
        directive
    }
}

/// Installs the global subscriber, reporting an error if one is already set.
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to stderr.
pub fn try_init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(config.directive()),
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(config.target)
        .with_thread_ids(config.thread_ids);

    let installed = match (config.json, config.timestamps) {
        (true, true) => builder.json().try_init(),
        (true, false) => builder.json().without_time().try_init(),
        (false, true) => builder.try_init(),
        (false, false) => builder.without_time().try_init(),
    };
    installed.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

/// Installs the global subscriber once; later calls keep the existing one.
///
/// ```no_run
/// use callguard::logging::{init_logging, LogLevel, LoggingConfig};
///
/// init_logging(&LoggingConfig::new().with_level(LogLevel::Debug).with_json(true));
/// ```
pub fn init_logging(config: &LoggingConfig) {
    if let Err(error) = try_init_logging(config) {
        tracing::debug!(%error, "log subscriber already installed");
    }
}
