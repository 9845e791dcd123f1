//! Debounce utility for coalescing bursts of file changes.
//!
//! Editors and build tools rarely touch a single file: a "save all" or a
//! branch checkout produces dozens of events within milliseconds. The
//! [`ChangeDebouncer`] folds such a burst into one [`Trigger`] so the test
//! suite runs once per burst.
//!
//! # Architecture
//!
//! A background task owns a single pending deadline. For every accepted
//! [`ChangeEvent`]:
//!
//! 1. Events matching the exclusion [`PathFilter`] are dropped
//! 2. The event is folded into the pending burst
//! 3. The deadline is reset to `now + quiet_period`
//!
//! When the deadline passes without a reset, exactly one [`Trigger`] is
//! emitted and the timer is cleared.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use testwatch_monitor::types::{ChangeEvent, ChangeKind};
//! use testwatch_monitor::utils::{ChangeDebouncer, PathFilter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (trigger_tx, mut trigger_rx) = mpsc::channel(16);
//!     let debouncer = ChangeDebouncer::new(
//!         Duration::from_millis(200),
//!         PathFilter::empty(),
//!         trigger_tx,
//!     );
//!
//!     for name in ["a.rs", "b.rs", "c.rs"] {
//!         debouncer.send(ChangeEvent::new(name, ChangeKind::Modified)).await.unwrap();
//!     }
//!
//!     // One trigger for the whole burst
//!     let trigger = trigger_rx.recv().await.unwrap();
//!     assert_eq!(trigger.change_count, 3);
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::types::{ChangeEvent, Trigger};
use crate::utils::path_filter::PathFilter;

/// Capacity of the debouncer's input channel.
const INPUT_CHANNEL_CAPACITY: usize = 1000;

/// Error type for debouncer operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DebouncerError {
    /// The debouncer's input channel has been closed.
    #[error("debouncer channel closed")]
    ChannelClosed,
}

/// Changes accumulated since the last trigger.
#[derive(Debug)]
struct PendingBurst {
    change_count: usize,
    paths: Vec<PathBuf>,
    deadline: Instant,
}

impl PendingBurst {
    fn into_trigger(self) -> Trigger {
        Trigger {
            change_count: self.change_count,
            paths: self.paths,
            fired_at: Utc::now(),
        }
    }
}

/// Coalesces change events into one trigger per quiet period.
#[derive(Debug)]
pub struct ChangeDebouncer {
    /// Channel for sending events to the background task.
    input_tx: mpsc::Sender<ChangeEvent>,
    /// Handle to the background task.
    task_handle: JoinHandle<()>,
}

impl ChangeDebouncer {
    /// Creates a debouncer and spawns its background task.
    ///
    /// # Arguments
    ///
    /// * `quiet_period` - How long the input must stay silent before a trigger fires
    /// * `filter` - Exclusion patterns applied before events reach the timer
    /// * `output_tx` - Channel receiving the coalesced triggers
    #[must_use]
    pub fn new(quiet_period: Duration, filter: PathFilter, output_tx: mpsc::Sender<Trigger>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);

        let task_handle = tokio::spawn(async move {
            run_debounce_loop(quiet_period, filter, input_rx, output_tx).await;
        });

        Self {
            input_tx,
            task_handle,
        }
    }

    /// Returns a sender feeding this debouncer, e.g. for a [`crate::watcher::FileWatcher`].
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<ChangeEvent> {
        self.input_tx.clone()
    }

    /// Sends a change event to be debounced.
    ///
    /// # Errors
    ///
    /// Returns `DebouncerError::ChannelClosed` if the background task has
    /// terminated.
    pub async fn send(&self, event: ChangeEvent) -> Result<(), DebouncerError> {
        self.input_tx
            .send(event)
            .await
            .map_err(|_| DebouncerError::ChannelClosed)
    }

    /// Attempts to send an event without waiting.
    ///
    /// Returns `false` if the channel is full or closed.
    pub fn try_send(&self, event: ChangeEvent) -> bool {
        self.input_tx.try_send(event).is_ok()
    }

    /// Stops the debouncer, discarding any pending burst.
    pub fn cancel(self) {
        self.task_handle.abort();
    }
}

/// Runs the debounce loop until the input channel closes.
async fn run_debounce_loop(
    quiet_period: Duration,
    filter: PathFilter,
    mut input_rx: mpsc::Receiver<ChangeEvent>,
    output_tx: mpsc::Sender<Trigger>,
) {
    let mut pending: Option<PendingBurst> = None;

    debug!(
        quiet_period_ms = quiet_period.as_millis(),
        "Starting debounce loop"
    );

    loop {
        let deadline = pending.as_ref().map(|burst| burst.deadline);

        tokio::select! {
            event = input_rx.recv() => {
                match event {
                    Some(event) => {
                        if filter.is_excluded(&event.path) {
                            trace!(path = %event.path.display(), "Ignoring excluded path");
                            continue;
                        }
                        let deadline = Instant::now() + quiet_period;
                        let burst = pending.get_or_insert_with(|| PendingBurst {
                            change_count: 0,
                            paths: Vec::new(),
                            deadline,
                        });
                        burst.change_count += 1;
                        burst.deadline = deadline;
                        if !burst.paths.contains(&event.path) {
                            burst.paths.push(event.path);
                        }
                        trace!(pending = burst.change_count, "Timer reset");
                    }
                    None => {
                        if let Some(burst) = pending.take() {
                            debug!("Input channel closed, flushing pending burst");
                            emit(burst, &output_tx).await;
                        }
                        break;
                    }
                }
            }

            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(burst) = pending.take() {
                    emit(burst, &output_tx).await;
                }
            }
        }
    }

    debug!("Debounce loop terminated");
}

async fn emit(burst: PendingBurst, output_tx: &mpsc::Sender<Trigger>) {
    let trigger = burst.into_trigger();
    debug!(
        changes = trigger.change_count,
        paths = trigger.paths.len(),
        "Quiet period elapsed, emitting trigger"
    );
    if let Err(e) = output_tx.send(trigger).await {
        warn!(error = %e, "Failed to emit trigger");
    }
}
