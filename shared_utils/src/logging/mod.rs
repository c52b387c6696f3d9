//! Logging setup for `overlayd`.
//!
//! A single `tracing` registry: an `EnvFilter` (`RUST_LOG` directives on top
//! of the configured level), a stdout layer and, when `log_dir` is set, a
//! daily rolling file layer. Records from the `log` crate are bridged in.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Prefix of the rolling log files; the date is appended per rotation.
pub const LOG_FILE_PREFIX: &str = "overlayd.log";

/// Command-line settings that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct LogOverrides {
    pub level: Option<String>,
    pub json: bool,
}

/// Effective logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub json: bool,
    pub directory: Option<PathBuf>,
}

impl LogSettings {
    /// Merge the config file with command-line overrides. Unknown level
    /// names fall back to INFO.
    pub fn resolve(config: &Config, overrides: &LogOverrides) -> Self {
        let level = overrides
            .level
            .as_deref()
            .unwrap_or(config.log_level.as_str())
            .parse()
            .unwrap_or(Level::INFO);
        LogSettings {
            level,
            json: overrides.json,
            directory: config.log_dir.as_ref().map(PathBuf::from),
        }
    }
}

/// Install the global subscriber for `overlayd`.
///
/// Keep the returned guard alive until exit; dropping it flushes the file
/// writer. A subscriber installed earlier in the process is left in place.
pub fn init_logging_from_config(config: &Config, overrides: &LogOverrides) -> Option<WorkerGuard> {
    install(&LogSettings::resolve(config, overrides))
}

fn install(settings: &LogSettings) -> Option<WorkerGuard> {
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(settings.level.into());

    let stdout = fmt::layer().with_target(true);
    let stdout = if settings.json {
        stdout.json().boxed()
    } else {
        stdout.boxed()
    };

    let (file, guard) = match &settings.directory {
        Some(directory) => {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling::daily(directory, LOG_FILE_PREFIX));
            let layer = fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer);
            let layer = if settings.json {
                layer.json().boxed()
            } else {
                layer.boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_prefers_command_line() {
        let mut config = Config::default();
        config.log_level = "warn".to_string();
        config.log_dir = Some("/tmp/overlay-logs".to_string());

        let from_file = LogSettings::resolve(&config, &LogOverrides::default());
        assert_eq!(from_file.level, Level::WARN);
        assert!(!from_file.json);
        assert_eq!(from_file.directory, Some(PathBuf::from("/tmp/overlay-logs")));

        let overridden = LogSettings::resolve(
            &config,
            &LogOverrides {
                level: Some("TRACE".to_string()),
                json: true,
            },
        );
        assert_eq!(overridden.level, Level::TRACE);
        assert!(overridden.json);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let overrides = LogOverrides {
            level: Some("chatty".to_string()),
            json: false,
        };
        let settings = LogSettings::resolve(&Config::default(), &overrides);
        assert_eq!(settings.level, Level::INFO);
        assert_eq!(settings.directory, None);
    }

    #[test]
    fn test_log_dir_receives_rolling_file() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.log_dir = Some(dir.path().to_string_lossy().into_owned());

        let guard = init_logging_from_config(&config, &LogOverrides::default());
        assert!(guard.is_some());
        tracing::info!(component = "logging", "file layer installed");
        drop(guard);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|name| name.starts_with(LOG_FILE_PREFIX)));
    }
}
