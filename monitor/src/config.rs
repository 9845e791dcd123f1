//! Configuration module for testwatch.
//!
//! This module handles parsing configuration from environment variables.
//! Command-line flags in the binary override the values read here.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TESTWATCH_TEST_COMMAND` | Yes* | - | Test command, run through the shell |
//! | `TESTWATCH_PROJECT_DIR` | No | current dir | Working directory for the test command |
//! | `TESTWATCH_WATCH_PATHS` | No | project dir | Comma-separated paths to watch |
//! | `TESTWATCH_EXCLUDE_PATHS` | No | `.git,.testwatch,target,node_modules,vendor` | Comma-separated globs or directory names |
//! | `TESTWATCH_DEBOUNCE_MS` | No | 300 | Quiet period before a run is triggered |
//! | `TESTWATCH_TEST_TIMEOUT_MS` | No | 600000 | Test run timeout |
//! | `TESTWATCH_KILL_GRACE_MS` | No | 5000 | Grace period between SIGTERM and SIGKILL |
//! | `TESTWATCH_NOTIFICATION_CHANNEL` | No | `desktop` | `desktop`, `webhook` or `none` |
//! | `TESTWATCH_WEBHOOK_URL` | With `webhook` | - | Webhook endpoint |
//! | `TESTWATCH_OUTPUT_FORMAT` | No | `auto` | `auto`, `cargo`, `pytest`, `phpunit` or `tap` |
//! | `TESTWATCH_STATE_DIR` | No | `~/.testwatch` | Directory for persisted notification history |
//! | `TESTWATCH_RUN_ON_START` | No | `true` | Run the tests once when watching starts |
//!
//! \* unless the command is given on the command line.
//!
//! # Example
//!
//! ```no_run
//! use testwatch_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Test command: {}", config.test_command);
//! ```

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::classifier::OutputFormat;
use crate::utils::path_filter::PathFilter;

/// Default quiet period in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Default test timeout in milliseconds (10 minutes).
pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 600_000;

/// Default grace period between graceful and forced termination.
pub const DEFAULT_KILL_GRACE_MS: u64 = 5_000;

/// Default exclusion set.
const DEFAULT_EXCLUDE_PATHS: &[&str] = &[".git", ".testwatch", "target", "node_modules", "vendor"];

/// Default state directory name relative to home.
const DEFAULT_STATE_DIR: &str = ".testwatch";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Where failure notifications are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationChannel {
    /// OS desktop notification.
    #[default]
    Desktop,
    /// HTTP POST to `webhook_url`.
    Webhook,
    /// Notifications disabled.
    None,
}

impl FromStr for NotificationChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "webhook" => Ok(Self::Webhook),
            "none" | "off" => Ok(Self::None),
            other => Err(format!(
                "expected one of desktop, webhook, none, got '{other}'"
            )),
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Desktop => "desktop",
            Self::Webhook => "webhook",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// Configuration for a watched project.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shell command that runs the test suite.
    pub test_command: String,

    /// Working directory of the test command.
    pub project_dir: PathBuf,

    /// Paths watched recursively for changes.
    pub watched_paths: Vec<PathBuf>,

    /// Glob patterns (or bare directory names) whose changes are ignored.
    pub exclude_paths: Vec<String>,

    /// Quiet period before a burst of changes triggers a run.
    pub debounce_ms: u64,

    /// Maximum duration of a test run.
    pub test_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL when a run is terminated.
    pub kill_grace_ms: u64,

    /// Notification delivery channel.
    pub notification_channel: NotificationChannel,

    /// Webhook endpoint, required when `notification_channel` is `Webhook`.
    pub webhook_url: Option<String>,

    /// Runner output format used to extract failing tests.
    pub output_format: OutputFormat,

    /// Directory holding `notifications.json`.
    pub state_dir: PathBuf,

    /// Run the tests once as soon as watching starts.
    pub run_on_start: bool,
}

impl Config {
    /// Creates a configuration with default settings for `project_dir`.
    ///
    /// The project directory is the only watched path and notification
    /// history is kept under `<project_dir>/.testwatch`.
    #[must_use]
    pub fn new(test_command: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            test_command: test_command.into(),
            watched_paths: vec![project_dir.clone()],
            exclude_paths: default_exclude_paths(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            test_timeout_ms: DEFAULT_TEST_TIMEOUT_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            notification_channel: NotificationChannel::Desktop,
            webhook_url: None,
            output_format: OutputFormat::Auto,
            state_dir: project_dir.join(DEFAULT_STATE_DIR),
            project_dir,
            run_on_start: true,
        }
    }

    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `TESTWATCH_TEST_COMMAND` is not set
    /// - a numeric or enum variable cannot be parsed
    /// - `webhook` is selected without `TESTWATCH_WEBHOOK_URL`
    /// - the home directory cannot be determined (needed for the state dir)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_command(None)
    }

    /// Like [`Config::from_env`], but `command` takes precedence over
    /// `TESTWATCH_TEST_COMMAND` when present.
    pub fn from_env_with_command(command: Option<String>) -> Result<Self, ConfigError> {
        let test_command = match command {
            Some(cmd) => cmd,
            None => env::var("TESTWATCH_TEST_COMMAND")
                .map_err(|_| ConfigError::MissingEnvVar("TESTWATCH_TEST_COMMAND".to_string()))?,
        };
        if test_command.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TESTWATCH_TEST_COMMAND".to_string(),
                message: "test command cannot be empty".to_string(),
            });
        }

        let project_dir = match env::var("TESTWATCH_PROJECT_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => env::current_dir().map_err(|e| ConfigError::InvalidValue {
                key: "TESTWATCH_PROJECT_DIR".to_string(),
                message: format!("cannot determine current directory: {e}"),
            })?,
        };

        let watched_paths = match env::var("TESTWATCH_WATCH_PATHS") {
            Ok(val) => {
                let paths: Vec<PathBuf> = split_list(&val)
                    .into_iter()
                    .map(|p| resolve_against(&project_dir, p))
                    .collect();
                if paths.is_empty() {
                    vec![project_dir.clone()]
                } else {
                    paths
                }
            }
            Err(_) => vec![project_dir.clone()],
        };

        let exclude_paths = env::var("TESTWATCH_EXCLUDE_PATHS")
            .map(|val| split_list(&val))
            .unwrap_or_else(|_| default_exclude_paths());

        let debounce_ms = parse_u64("TESTWATCH_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS, 0)?;
        let test_timeout_ms = parse_u64("TESTWATCH_TEST_TIMEOUT_MS", DEFAULT_TEST_TIMEOUT_MS, 1)?;
        let kill_grace_ms = parse_u64("TESTWATCH_KILL_GRACE_MS", DEFAULT_KILL_GRACE_MS, 0)?;

        let notification_channel = match env::var("TESTWATCH_NOTIFICATION_CHANNEL") {
            Ok(val) => val
                .parse::<NotificationChannel>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "TESTWATCH_NOTIFICATION_CHANNEL".to_string(),
                    message,
                })?,
            Err(_) => NotificationChannel::Desktop,
        };

        let webhook_url = env::var("TESTWATCH_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let output_format = match env::var("TESTWATCH_OUTPUT_FORMAT") {
            Ok(val) => val
                .parse::<OutputFormat>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "TESTWATCH_OUTPUT_FORMAT".to_string(),
                    message,
                })?,
            Err(_) => OutputFormat::Auto,
        };

        let state_dir = match env::var("TESTWATCH_STATE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_state_dir()?,
        };

        let run_on_start = match env::var("TESTWATCH_RUN_ON_START") {
            Ok(val) => parse_bool(&val).ok_or_else(|| ConfigError::InvalidValue {
                key: "TESTWATCH_RUN_ON_START".to_string(),
                message: format!("expected true or false, got '{val}'"),
            })?,
            Err(_) => true,
        };

        let config = Self {
            test_command,
            project_dir,
            watched_paths,
            exclude_paths,
            debounce_ms,
            test_timeout_ms,
            kill_grace_ms,
            notification_channel,
            webhook_url,
            output_format,
            state_dir,
            run_on_start,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// Called by [`Config::from_env`]; callers that modify fields afterwards
    /// (e.g. from command-line flags) should call it again.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TESTWATCH_TEST_TIMEOUT_MS".to_string(),
                message: "timeout must be greater than 0".to_string(),
            });
        }
        if self.notification_channel == NotificationChannel::Webhook && self.webhook_url.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "TESTWATCH_WEBHOOK_URL".to_string(),
            ));
        }
        PathFilter::new(&self.exclude_paths, &self.watched_paths)?;
        Ok(())
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Path of the persisted notification history.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("notifications.json")
    }
}

/// Resolves the state directory from `TESTWATCH_STATE_DIR` or the home directory.
///
/// Used by commands that only touch notification history and need no test
/// command.
pub fn state_dir_from_env() -> Result<PathBuf, ConfigError> {
    match env::var("TESTWATCH_STATE_DIR") {
        Ok(dir) => Ok(PathBuf::from(dir)),
        Err(_) => default_state_dir(),
    }
}

fn default_state_dir() -> Result<PathBuf, ConfigError> {
    let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
    Ok(base_dirs.home_dir().join(DEFAULT_STATE_DIR))
}

fn default_exclude_paths() -> Vec<String> {
    DEFAULT_EXCLUDE_PATHS.iter().map(|s| s.to_string()).collect()
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn resolve_against(base: &std::path::Path, path: String) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn parse_u64(key: &str, default: u64, min: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(val) => {
            let parsed = val.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected non-negative integer, got '{val}'"),
            })?;
            if parsed < min {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("value must be at least {min}"),
                });
            }
            Ok(parsed)
        }
        Err(_) => Ok(default),
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
