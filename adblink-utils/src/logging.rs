//! Logging infrastructure for adblink
//!
//! Provides unified logging setup using the tracing ecosystem. The broker
//! runs inside a host process that may already own stderr, so the embedded
//! preset logs to a file under the XDG state directory.

use std::path::Path;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{paths, AdblinkError, Result};

/// Environment variable holding the log filter
pub const LOG_ENV_VAR: &str = "ADBLINK_LOG";

/// Log output destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Log to stderr
    Stderr,
    /// Log to file
    File,
    /// Log to both stderr and file
    Both,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output destination
    pub output: LogOutput,
    /// Log level filter (e.g., "info", "adblink_broker=debug")
    pub filter: String,
    /// Include span events (enter/exit)
    pub span_events: bool,
    /// Include file/line in logs
    pub file_line: bool,
    /// Optional custom log file name (defaults to "adblink.log")
    pub file_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "info".into(),
            span_events: false,
            file_line: false,
            file_name: None,
        }
    }
}

impl LogConfig {
    /// Create config for a broker embedded in a host process (file logging)
    pub fn embedded() -> Self {
        Self {
            output: LogOutput::File,
            filter: std::env::var(LOG_ENV_VAR).unwrap_or_else(|_| "info".into()),
            span_events: false,
            file_line: true,
            file_name: None,
        }
    }

    /// Create config for development (verbose stderr, protocol tracing on)
    pub fn development() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "debug,adblink_broker=trace".into(),
            span_events: true,
            file_line: true,
            file_name: None,
        }
    }
}

/// Initialize logging with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(LogConfig::default())
}

/// Initialize logging with custom configuration
pub fn init_logging_with_config(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| AdblinkError::config(format!("Invalid log filter: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true);

    let fmt_layer = if config.span_events {
        fmt_layer.with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
    } else {
        fmt_layer
    };

    let fmt_layer = if config.file_line {
        fmt_layer.with_file(true).with_line_number(true)
    } else {
        fmt_layer.with_file(false).with_line_number(false)
    };

    let file_name = config.file_name.as_deref().unwrap_or("adblink.log");

    match config.output {
        LogOutput::Stderr => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| AdblinkError::internal(format!("Failed to init logging: {}", e)))?;
        }
        LogOutput::File => {
            let file = open_log_file(file_name)?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(file).with_ansi(false))
                .try_init()
                .map_err(|e| AdblinkError::internal(format!("Failed to init logging: {}", e)))?;
        }
        LogOutput::Both => {
            let file = open_log_file(file_name)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(std::io::stderr))
                .with(file_layer)
                .try_init()
                .map_err(|e| AdblinkError::internal(format!("Failed to init logging: {}", e)))?;
        }
    }

    Ok(())
}

fn open_log_file(file_name: &str) -> Result<std::fs::File> {
    open_log_file_in(&paths::log_dir(), file_name)
}

fn open_log_file_in(log_dir: &Path, file_name: &str) -> Result<std::fs::File> {
    paths::ensure_dir(log_dir).map_err(|e| AdblinkError::FileWrite {
        path: log_dir.to_path_buf(),
        source: e,
    })?;

    let log_path = log_dir.join(file_name);
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| AdblinkError::FileWrite {
            path: log_path,
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_log_output_equality() {
        assert_eq!(LogOutput::Stderr, LogOutput::Stderr);
        assert_ne!(LogOutput::Stderr, LogOutput::File);
        assert_ne!(LogOutput::File, LogOutput::Both);
    }

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.output, LogOutput::Stderr);
        assert_eq!(config.filter, "info");
        assert!(!config.span_events);
        assert!(!config.file_line);
        assert!(config.file_name.is_none());
    }

    #[test]
    fn test_log_config_embedded_uses_file() {
        let config = LogConfig::embedded();
        assert_eq!(config.output, LogOutput::File);
        assert!(config.file_line);
    }

    #[test]
    fn test_log_config_embedded_filter_from_env() {
        let original = env::var(LOG_ENV_VAR).ok();

        env::set_var(LOG_ENV_VAR, "adblink_broker=trace");
        assert_eq!(LogConfig::embedded().filter, "adblink_broker=trace");

        env::remove_var(LOG_ENV_VAR);
        assert_eq!(LogConfig::embedded().filter, "info");

        if let Some(val) = original {
            env::set_var(LOG_ENV_VAR, val);
        }
    }

    #[test]
    fn test_log_config_development() {
        let config = LogConfig::development();
        assert_eq!(config.output, LogOutput::Stderr);
        assert!(config.filter.contains("adblink_broker=trace"));
        assert!(config.span_events);
        assert!(config.file_line);
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let config = LogConfig {
            filter: "adblink=notalevel".into(),
            ..LogConfig::default()
        };
        let err = init_logging_with_config(config).unwrap_err();
        assert!(matches!(err, AdblinkError::Config(_)));
    }

    #[test]
    fn test_log_file_created_with_missing_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state").join("log");
        open_log_file_in(&dir, "adblink.log").unwrap();
        assert!(dir.join("adblink.log").is_file());
    }

    #[test]
    fn test_log_dir_blocked_by_file_is_write_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("log");
        std::fs::write(&blocker, b"").unwrap();

        let err = open_log_file_in(&blocker, "adblink.log").unwrap_err();
        let expected = blocker.join("adblink.log");
        assert!(matches!(err, AdblinkError::FileWrite { ref path, .. } if path == &expected));
    }

    // init_logging() itself is not exercised here: the global subscriber can
    // only be installed once per test process.
}
