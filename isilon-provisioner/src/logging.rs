//! Logging configuration module
//! Console output plus an optional rolling JSON log file

use serde::{Deserialize, Serialize};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,             // log level (trace, debug, info, warn, error)
    pub file_path: Option<String>, // log directory; console only when unset
    pub rotation: LogRotation,     // log rotation policy
    pub json_format: bool,         // JSON console output
}

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            rotation: LogRotation::Daily,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Initialize logging based on configuration.
    ///
    /// The returned guard flushes the file writer on drop and must be held
    /// for the lifetime of the process.
    pub fn init(&self) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        let console_layer = if self.json_format {
            fmt::layer()
                .with_target(true)
                .with_writer(io::stderr)
                .json()
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
                .with_writer(io::stderr)
                .boxed()
        };

        let guard = if let Some(ref path) = self.file_path {
            let file_appender = match self.rotation {
                LogRotation::Hourly => rolling::hourly(path, "isilon-provisioner.log"),
                LogRotation::Daily => rolling::daily(path, "isilon-provisioner.log"),
                LogRotation::Never => rolling::never(path, "isilon-provisioner.log"),
            };

            let (non_blocking, guard) = non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()?;

            Some(guard)
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()?;

            None
        };

        tracing::info!("Logging initialized - level: {}", self.level);

        Ok(guard)
    }
}

/// Log a provisioning step with its volume context
#[macro_export]
macro_rules! log_volume_operation {
    ($op:expr, $volume:expr) => {
        tracing::info!(
            operation = $op,
            volume = %$volume,
            "Volume operation"
        )
    };
    ($op:expr, $volume:expr, $($key:ident = $value:expr),+) => {
        tracing::info!(
            operation = $op,
            volume = %$volume,
            $($key = $value),+,
            "Volume operation"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.file_path.is_none());
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_rotation_serialization() {
        let json = serde_json::to_string(&LogRotation::Hourly).unwrap();
        assert_eq!(json, "\"hourly\"");
    }
}
