//! Logging setup for applications embedding the session manager.
//!
//! The crate itself only emits `tracing` events (session creation, sweeps,
//! rejected cookies). Installing a subscriber is left to the application;
//! [`LogConfig`] is a small convenience for doing so.
//!
//! # Examples
//!
//! ```no_run
//! use armature_docsession::logging::*;
//!
//! LogConfig::new()
//!     .level(LogLevel::Debug)
//!     .format(LogFormat::Pretty)
//!     .try_init()
//!     .ok();
//!
//! info!("Sessions enabled");
//! ```

use crate::error::{SessionError, SessionResult};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use tracing::{debug, error, info, trace, warn};

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to string for EnvFilter
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Output format for log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured, machine-readable (default)
    Json,
    /// Colored, multi-line output for development
    Pretty,
    /// Minimal single-line output
    Compact,
}

/// Output destination for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Output destination
    pub output: LogOutput,
    /// Include target (module path)
    pub targets: bool,
    /// Custom environment filter (overrides level if set)
    pub env_filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            targets: true,
            env_filter: None,
        }
    }
}

impl LogConfig {
    /// Create a new logging configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set log level
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set output format
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set output destination
    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Enable or disable target (module path)
    pub fn with_targets(mut self, enable: bool) -> Self {
        self.targets = enable;
        self
    }

    /// Set custom environment filter
    ///
    /// ```
    /// # use armature_docsession::logging::*;
    /// let config = LogConfig::new()
    ///     .with_env_filter("armature_docsession=debug,reqwest=info");
    /// ```
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Build the filter: an explicit filter wins, then `RUST_LOG`, then `level`.
    pub fn build_filter(&self) -> SessionResult<EnvFilter> {
        match &self.env_filter {
            Some(filter) => EnvFilter::try_new(filter)
                .map_err(|e| SessionError::Config(format!("Invalid log filter: {}", e))),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    /// Install a global subscriber.
    ///
    /// Fails if the filter is invalid or a subscriber is already installed.
    pub fn try_init(self) -> SessionResult<()> {
        let filter = self.build_filter()?;

        match self.output {
            LogOutput::Stdout => self.install(filter, std::io::stdout),
            LogOutput::Stderr => self.install(filter, std::io::stderr),
        }
    }

    fn install<W>(&self, filter: EnvFilter, writer: W) -> SessionResult<()>
    where
        W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
    {
        let registry = tracing_subscriber::registry().with(filter);
        let result = match self.format {
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_target(self.targets),
                )
                .try_init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_writer(writer)
                        .with_target(self.targets),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    fmt::layer()
                        .compact()
                        .with_writer(writer)
                        .with_target(self.targets),
                )
                .try_init(),
        };

        result.map_err(|e| SessionError::Config(format!("Failed to install logger: {}", e)))
    }
}
