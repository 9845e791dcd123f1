//! testwatch - continuous test runner with failure notifications.
//!
//! This crate watches a project's source tree, reruns its test suite once
//! file changes settle and notifies the developer when tests fail, without
//! repeating the notification for a failure they have already been told
//! about.
//!
//! # Overview
//!
//! The pipeline is `watch → debounce → run → classify → notify`:
//!
//! 1. [`watcher::FileWatcher`] turns OS file notifications into change events.
//! 2. [`utils::ChangeDebouncer`] collapses each burst of changes into a single
//!    trigger after a quiet period.
//! 3. [`runner::TestRunner`] executes the test command with a timeout.
//! 4. [`classifier::ResultClassifier`] extracts failing test identifiers.
//! 5. [`state::NotificationStateStore`] decides whether the failure is new.
//! 6. [`notifier::Notifier`] delivers the notification.
//!
//! [`orchestrator::Orchestrator`] wires the stages together and owns the
//! lifecycle.
//!
//! # Modules
//!
//! - [`types`]: Change events, run results and failure signatures
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations
//! - [`watcher`]: File system watcher
//! - [`utils`]: Debouncing and path exclusion
//! - [`runner`]: Test command execution
//! - [`classifier`]: Test output parsing
//! - [`state`]: Notification suppression state
//! - [`notifier`]: Desktop, webhook and custom notification sinks
//! - [`events`]: Pipeline events for observers
//! - [`orchestrator`]: The end-to-end loop

pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod notifier;
pub mod orchestrator;
pub mod runner;
pub mod state;
pub mod types;
pub mod utils;
pub mod watcher;

pub use classifier::{OutputFormat, ResultClassifier};
pub use config::{Config, ConfigError, NotificationChannel};
pub use error::{MonitorError, Result};
pub use events::{EventBus, PipelineEvent, TestsFailedEvent, UserNotifiedEvent};
pub use notifier::{
    DesktopSink, Delivery, NotificationError, NotificationMessage, NotificationSink, Notifier,
    NullSink, WebhookSink,
};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorHandle, PipelineState, WatcherState,
};
pub use runner::TestRunner;
pub use state::{
    JsonFileStore, MemoryStore, NotificationStateStore, RecordStore, StateReader, StoreError,
};
pub use types::{
    ChangeEvent, ChangeKind, FailureEntry, FailureSignature, NotificationRecord, TestRunResult,
    TestStatus, Trigger,
};
pub use utils::{ChangeDebouncer, DebouncerError, PathFilter};
pub use watcher::{FileWatcher, WatchSetupError};
