//! Logging configuration
//!
//! Human-readable console output on stderr plus an optional rolling JSON
//! file. `RUST_LOG` wins over the configured level when set.

use crate::config::LogSettings;
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: Option<PathBuf>,
    pub rotation: LogRotation,
    /// JSON console output
    pub json_format: bool,
}

/// Log rotation policy for the file layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            rotation: LogRotation::Daily,
            json_format: false,
        }
    }
}

impl From<&LogSettings> for LoggingConfig {
    fn from(settings: &LogSettings) -> Self {
        Self {
            level: settings.level.clone(),
            log_dir: settings.log_dir.clone(),
            json_format: settings.json,
            ..Default::default()
        }
    }
}

impl LoggingConfig {
    /// Override the level, e.g. from `-v`/`-q` flags
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Build the level filter
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Initialize the global subscriber.
    ///
    /// The returned guard flushes the file writer on drop and must be held
    /// for the lifetime of the process.
    pub fn init(&self) -> io::Result<Option<WorkerGuard>> {
        let console_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_ansi(!self.json_format)
            .with_writer(io::stderr);

        let console_layer = if self.json_format {
            console_layer.json().boxed()
        } else {
            console_layer.boxed()
        };

        let mut guard = None;
        let file_layer = match self.log_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir)?;
                let appender = match self.rotation {
                    LogRotation::Hourly => rolling::hourly(dir, "virtcluster.log"),
                    LogRotation::Daily => rolling::daily(dir, "virtcluster.log"),
                    LogRotation::Never => rolling::never(dir, "virtcluster.log"),
                };
                let (writer, file_guard) = non_blocking(appender);
                guard = Some(file_guard);

                Some(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .json()
                        .with_writer(writer),
                )
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(self.env_filter())
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| io::Error::other(e.to_string()))?;

        tracing::debug!(level = %self.level, "Logging initialized");
        Ok(guard)
    }
}

/// Log a lifecycle step of a managed resource
#[macro_export]
macro_rules! log_resource {
    ($action:expr, $kind:expr, $name:expr) => {
        tracing::info!(action = $action, kind = $kind, name = %$name, "Resource")
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.log_dir.is_none());
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_from_settings() {
        let settings = LogSettings {
            level: "debug".to_string(),
            log_dir: Some(PathBuf::from("/tmp/virtcluster-logs")),
            json: true,
        };
        let config = LoggingConfig::from(&settings).with_level("trace");
        assert_eq!(config.level, "trace");
        assert!(config.json_format);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/virtcluster-logs")));
    }
}
