//! Console and rolling-file logging
//!
//! Besides the root `latchkey.log`, each primitive writes to its own file,
//! routed by tracing target:
//!
//! | Log File         | Component              | Target Prefixes              |
//! |------------------|------------------------|------------------------------|
//! | latchkey.log     | Root logger            | (all)                        |
//! | lock.log         | Locks and watchdogs    | latchkey_core::lock, guard   |
//! | rate-limit.log   | Rate limiting          | latchkey_core::rate_limit    |
//! | token.log        | Anti-replay tokens     | latchkey_core::token         |
//! | store.log        | Coordination store     | latchkey_store               |
//!
//! Files go to `~/latchkey/logs` unless `LATCHKEY_LOG_DIR` or `log.dir` says
//! otherwise.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::settings::LogSettings;

const ROOT_LOG_FILE: &str = "latchkey.log";

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "lock.log",
        targets: &["latchkey_core::lock", "latchkey_core::guard"],
    },
    ComponentLogDef {
        file_name: "rate-limit.log",
        targets: &["latchkey_core::rate_limit"],
    },
    ComponentLogDef {
        file_name: "token.log",
        targets: &["latchkey_core::token"],
    },
    ComponentLogDef {
        file_name: "store.log",
        targets: &["latchkey_store"],
    },
];

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub level: Level,
    pub file_logging: bool,
    pub rotation: Rotation,
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join("latchkey").join("logs")
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            level: Level::INFO,
            file_logging: false,
            rotation: Rotation::DAILY,
        }
    }
}

impl LoggingConfig {
    /// Start from the `log` settings section, then apply `LATCHKEY_LOG_DIR`,
    /// `LATCHKEY_LOG_LEVEL`, `LATCHKEY_LOG_CONSOLE` and `LATCHKEY_LOG_FILE`
    pub fn from_settings(settings: &LogSettings) -> Self {
        let defaults = Self::default();
        Self {
            log_dir: settings
                .dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            console_output: settings.console.unwrap_or(defaults.console_output),
            level: settings
                .level
                .as_deref()
                .and_then(|level| level.parse().ok())
                .unwrap_or(defaults.level),
            file_logging: settings.file.unwrap_or(defaults.file_logging),
            rotation: defaults.rotation,
        }
        .with_env()
    }

    fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("LATCHKEY_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(level) = std::env::var("LATCHKEY_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.level = level;
        }
        if let Ok(console) = std::env::var("LATCHKEY_LOG_CONSOLE") {
            self.console_output = parse_flag(&console);
        }
        if let Ok(file) = std::env::var("LATCHKEY_LOG_FILE") {
            self.file_logging = parse_flag(&file);
        }
        self
    }
}

/// Keeps file writers alive; buffered output is flushed on drop
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level for the console and root file.
/// Component files capture everything from their targets.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
        layers.push(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_filter(filter)
                .boxed(),
        );
    }

    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;

        let root = RollingFileAppender::new(config.rotation.clone(), &config.log_dir, ROOT_LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(root);
        guards.push(guard);
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .with_filter(filter)
                .boxed(),
        );

        for component in COMPONENT_LOGS {
            let appender =
                RollingFileAppender::new(config.rotation.clone(), &config.log_dir, component.file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let targets = component
                .targets
                .iter()
                .fold(Targets::new(), |targets, target| {
                    targets.with_target(*target, LevelFilter::TRACE)
                });
            layers.push(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(targets)
                    .boxed(),
            );
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            component_files = COMPONENT_LOGS.len(),
            "File logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let config = LoggingConfig::from_settings(&LogSettings {
            dir: Some("/tmp/latchkey-test-logs".to_string()),
            level: Some("debug".to_string()),
            console: Some(false),
            file: Some(true),
        });
        // Env overrides are unset in the test environment
        if std::env::var("LATCHKEY_LOG_DIR").is_err() {
            assert_eq!(config.log_dir, PathBuf::from("/tmp/latchkey-test-logs"));
        }
        if std::env::var("LATCHKEY_LOG_LEVEL").is_err() {
            assert_eq!(config.level, Level::DEBUG);
        }
    }

    #[test]
    fn test_defaults_keep_files_off() {
        let config = LoggingConfig::default();
        assert!(config.console_output);
        assert!(!config.file_logging);
        assert_eq!(config.level, Level::INFO);
        assert!(config.log_dir.ends_with("latchkey/logs"));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
    }

    #[test]
    fn test_component_log_definitions() {
        for component in COMPONENT_LOGS {
            assert!(component.file_name.ends_with(".log"));
            assert!(!component.targets.is_empty());
            assert!(component.targets.iter().all(|t| t.starts_with("latchkey_")));
        }
    }

    #[test]
    fn test_init_with_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: dir.path().join("logs"),
            console_output: false,
            file_logging: true,
            ..Default::default()
        };
        // Another test binary may already own the global subscriber
        if let Ok(guard) = init_logging(&config) {
            drop(guard);
            assert!(dir.path().join("logs").is_dir());
        }
    }
}
