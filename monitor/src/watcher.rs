//! File watcher for the project source tree.
//!
//! This module wraps the [`notify`] crate and turns file system notifications
//! for the configured paths into [`ChangeEvent`]s on a Tokio channel.
//!
//! # Architecture
//!
//! The notify callback is kept lightweight: it only maps the event and hands
//! it to an internal channel with `try_send`. A dedicated async task forwards
//! change events to the caller and handles watch errors, dropping the watch
//! for the offending path instead of tearing down the whole stream.
//!
//! Registration of each path is retried with exponential backoff when the
//! OS reports a transient failure (for example an exhausted inotify watch
//! budget that frees up shortly after). Missing paths and permission errors
//! fail immediately with [`WatchSetupError`].
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use tokio::sync::mpsc;
//! use testwatch_monitor::watcher::FileWatcher;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::channel(100);
//!     let watcher = FileWatcher::start(&[PathBuf::from("src")], tx).await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{:?} {}", event.kind, event.path.display());
//!     }
//!
//!     watcher.stop();
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::{AccessKind, ModifyKind};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConfigError;
use crate::types::{ChangeEvent, ChangeKind};

/// Maximum registration attempts per path before giving up.
pub const MAX_WATCH_ATTEMPTS: u32 = 4;

/// Delay before the first registration retry.
const INITIAL_RETRY_DELAY_MS: u64 = 100;

/// Jitter factor (±25%) applied to retry delays.
const JITTER_FACTOR: f64 = 0.25;

/// Capacity of the channel between the notify callback and the async task.
const INTERNAL_CHANNEL_CAPACITY: usize = 1000;

/// Errors that prevent the watcher from starting.
#[derive(Error, Debug)]
pub enum WatchSetupError {
    /// A configured path does not exist.
    #[error("watch path does not exist: {0}")]
    PathNotFound(PathBuf),

    /// A configured path cannot be read.
    #[error("permission denied for watch path: {0}")]
    PermissionDenied(PathBuf),

    /// No paths were configured.
    #[error("no paths to watch")]
    NoPaths,

    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    /// Registration kept failing after all retries.
    #[error("failed to watch {path} after {attempts} attempts: {source}")]
    Registration {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: notify::Error,
    },

    /// An exclusion pattern could not be compiled.
    #[error("invalid exclusion pattern: {0}")]
    InvalidExclude(#[from] ConfigError),
}

/// Messages from the notify callback, processed by the async task.
#[derive(Debug)]
enum InternalEvent {
    Change(ChangeEvent),
    Failed { paths: Vec<PathBuf>, error: String },
}

/// State shared between the watcher handle and its forwarding task.
#[derive(Debug)]
struct WatchSet {
    watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
    /// Paths inside a root whose changes are no longer reported.
    dropped: Vec<PathBuf>,
}

impl WatchSet {
    fn new(watcher: RecommendedWatcher, roots: Vec<PathBuf>) -> Self {
        Self {
            watcher,
            roots,
            dropped: Vec::new(),
        }
    }

    /// Drops the watch for `path` after an error.
    ///
    /// A registered root is unwatched. A path inside a recursive root only
    /// stops being reported; the root keeps its OS watch.
    fn drop_watch(&mut self, path: &Path) {
        if let Some(idx) = self.roots.iter().position(|root| root == path) {
            let root = self.roots.remove(idx);
            if let Err(e) = self.watcher.unwatch(&root) {
                debug!(path = %root.display(), error = %e, "Unwatch after error failed");
            }
            self.dropped.retain(|p| !p.starts_with(&root));
            warn!(
                path = %root.display(),
                remaining = self.roots.len(),
                "Dropped watch root after error"
            );
            return;
        }

        if !self.roots.iter().any(|root| path.starts_with(root)) || self.is_dropped(path) {
            return;
        }
        self.dropped.retain(|p| !p.starts_with(path));
        self.dropped.push(path.to_path_buf());
        warn!(path = %path.display(), "Dropped watch after error");
    }

    fn is_dropped(&self, path: &Path) -> bool {
        self.dropped.iter().any(|p| path.starts_with(p))
    }
}

/// Watches a set of paths recursively and emits [`ChangeEvent`]s.
///
/// The stream ends when the watcher is stopped or dropped; a stopped watcher
/// cannot be restarted.
#[derive(Debug)]
pub struct FileWatcher {
    watch_set: Arc<Mutex<WatchSet>>,
    task_handle: JoinHandle<()>,
}

impl FileWatcher {
    /// Registers recursive watches for `paths` and starts forwarding events.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `paths` is empty
    /// - a path does not exist or is not readable
    /// - the OS watcher cannot be created
    /// - registration of a path still fails after [`MAX_WATCH_ATTEMPTS`]
    pub async fn start(
        paths: &[PathBuf],
        event_sender: mpsc::Sender<ChangeEvent>,
    ) -> Result<Self, WatchSetupError> {
        if paths.is_empty() {
            return Err(WatchSetupError::NoPaths);
        }
        for path in paths {
            check_path(path)?;
        }

        let (internal_tx, internal_rx) = mpsc::channel::<InternalEvent>(INTERNAL_CHANNEL_CAPACITY);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                handle_notify_event(res, &internal_tx);
            },
            Config::default(),
        )
        .map_err(WatchSetupError::WatcherInit)?;

        let mut roots = Vec::with_capacity(paths.len());
        for path in paths {
            register_with_retry(path, |p| watcher.watch(p, RecursiveMode::Recursive)).await?;
            roots.push(path.clone());
        }

        info!(paths = ?roots, "Started file watcher");

        let watch_set = Arc::new(Mutex::new(WatchSet::new(watcher, roots)));
        let task_handle = tokio::spawn(forward_events(
            internal_rx,
            Arc::clone(&watch_set),
            event_sender,
        ));

        Ok(Self {
            watch_set,
            task_handle,
        })
    }

    /// Returns the roots that are still being watched.
    #[must_use]
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        match self.watch_set.lock() {
            Ok(set) => set.roots.clone(),
            Err(poisoned) => poisoned.into_inner().roots.clone(),
        }
    }

    /// Releases every OS watch handle and ends the event stream.
    pub fn stop(self) {
        // Drop does the work; this makes the intent explicit at call sites.
        drop(self);
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        let mut set = match self.watch_set.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        let roots = std::mem::take(&mut set.roots);
        for root in &roots {
            if let Err(e) = set.watcher.unwatch(root) {
                trace!(path = %root.display(), error = %e, "Unwatch on stop failed");
            }
        }
        drop(set);
        self.task_handle.abort();
        debug!(released = roots.len(), "File watcher stopped");
    }
}

/// Verifies that a path exists and is readable before watching it.
fn check_path(path: &Path) -> Result<(), WatchSetupError> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if meta.is_dir() {
                std::fs::read_dir(path).map_err(|e| map_io_error(path, e))?;
            }
            Ok(())
        }
        Err(e) => Err(map_io_error(path, e)),
    }
}

fn map_io_error(path: &Path, e: std::io::Error) -> WatchSetupError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => WatchSetupError::PermissionDenied(path.to_path_buf()),
        _ => WatchSetupError::PathNotFound(path.to_path_buf()),
    }
}

/// Registers one watch through `watch`, retrying transient failures with
/// backoff.
async fn register_with_retry<F>(path: &Path, mut watch: F) -> Result<(), WatchSetupError>
where
    F: FnMut(&Path) -> notify::Result<()>,
{
    let mut delay = Duration::from_millis(INITIAL_RETRY_DELAY_MS);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match watch(path) {
            Ok(()) => {
                debug!(path = %path.display(), attempts, "Registered recursive watch");
                return Ok(());
            }
            Err(e) => {
                if let Some(fatal) = classify_watch_error(path, &e) {
                    return Err(fatal);
                }
                if attempts >= MAX_WATCH_ATTEMPTS {
                    error!(path = %path.display(), attempts, error = %e, "Giving up on watch");
                    return Err(WatchSetupError::Registration {
                        path: path.to_path_buf(),
                        attempts,
                        source: e,
                    });
                }
                let wait = add_jitter(delay);
                warn!(
                    path = %path.display(),
                    attempt = attempts,
                    delay_ms = wait.as_millis(),
                    error = %e,
                    "Watch registration failed, retrying"
                );
                sleep(wait).await;
                delay *= 2;
            }
        }
    }
}

/// Returns the non-retryable setup error for `e`, if it is one.
fn classify_watch_error(path: &Path, e: &notify::Error) -> Option<WatchSetupError> {
    match &e.kind {
        notify::ErrorKind::PathNotFound => Some(WatchSetupError::PathNotFound(path.to_path_buf())),
        notify::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            Some(WatchSetupError::PathNotFound(path.to_path_buf()))
        }
        notify::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            Some(WatchSetupError::PermissionDenied(path.to_path_buf()))
        }
        _ => None,
    }
}

/// Adds ±25% jitter to a duration.
fn add_jitter(duration: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * JITTER_FACTOR;
    let jitter = rng.random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.001))
}

/// Maps a notify event kind to a change kind; `None` means ignore.
fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        // Closing a file that was open for writing is reported as an access
        // event by inotify; editors that write in place rely on it.
        EventKind::Access(AccessKind::Close(notify::event::AccessMode::Write)) => {
            Some(ChangeKind::Modified)
        }
        _ => None,
    }
}

/// Handles events from the notify crate on its own thread.
fn handle_notify_event(res: notify::Result<Event>, internal_tx: &mpsc::Sender<InternalEvent>) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            let failed = InternalEvent::Failed {
                paths: e.paths.clone(),
                error: e.to_string(),
            };
            if internal_tx.try_send(failed).is_err() {
                error!(error = %e, "File watcher error (not forwarded)");
            }
            return;
        }
    };

    trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

    let Some(kind) = change_kind(&event.kind) else {
        return;
    };

    for path in event.paths {
        // Use try_send to avoid blocking the notify thread
        if let Err(e) = internal_tx.try_send(InternalEvent::Change(ChangeEvent::new(path, kind))) {
            warn!(error = %e, "Failed to queue change event, channel may be full");
        }
    }
}

/// Async task that forwards change events and handles watch errors.
async fn forward_events(
    mut rx: mpsc::Receiver<InternalEvent>,
    watch_set: Arc<Mutex<WatchSet>>,
    sender: mpsc::Sender<ChangeEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            InternalEvent::Change(change) => {
                let dropped = match watch_set.lock() {
                    Ok(set) => set.is_dropped(&change.path),
                    Err(poisoned) => poisoned.into_inner().is_dropped(&change.path),
                };
                if dropped {
                    trace!(path = %change.path.display(), "Ignoring change under dropped path");
                    continue;
                }
                if sender.send(change).await.is_err() {
                    debug!("Change receiver closed, stopping forwarder");
                    break;
                }
            }
            InternalEvent::Failed { paths, error } => {
                warn!(paths = ?paths, error = %error, "File watcher error");
                if paths.is_empty() {
                    continue;
                }
                let mut set = match watch_set.lock() {
                    Ok(set) => set,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for path in &paths {
                    set.drop_watch(path);
                }
            }
        }
    }

    debug!("Watch event forwarder shutting down");
}
