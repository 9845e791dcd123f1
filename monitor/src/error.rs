//! Error types for testwatch.
//!
//! Each module owns a focused error enum; [`MonitorError`] unifies them for
//! callers that drive several components at once.

use thiserror::Error;

use crate::config::ConfigError;
use crate::notifier::NotificationError;
use crate::state::StoreError;
use crate::watcher::WatchSetupError;

/// Errors that can occur while setting up or driving the watcher.
///
/// # Examples
///
/// ```
/// use testwatch_monitor::error::{MonitorError, Result};
///
/// fn read_history(path: &std::path::Path) -> Result<String> {
///     Ok(std::fs::read_to_string(path)?)
/// }
///
/// let err = read_history(std::path::Path::new("/nonexistent/notifications.json")).unwrap_err();
/// assert!(matches!(err, MonitorError::Io(_)));
/// ```
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file watcher could not start.
    #[error("file watch error: {0}")]
    Watch(#[from] WatchSetupError),

    /// Notification history could not be read or written.
    #[error("notification state error: {0}")]
    Store(#[from] StoreError),

    /// A notification could not be delivered.
    #[error("notification error: {0}")]
    Notification(#[from] NotificationError),
}

/// A specialized `Result` type for testwatch operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
