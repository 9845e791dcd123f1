//! The watch → debounce → run → classify → notify loop.
//!
//! An [`Orchestrator`] is assembled with [`Orchestrator::builder`] and turned
//! into a running pipeline with [`Orchestrator::start`]. The pipeline runs in
//! one Tokio task which owns the runner, the notification state and the
//! [`WatcherState`]; callers interact with it through the returned
//! [`OrchestratorHandle`].
//!
//! # State machine
//!
//! ```text
//! Idle → Watching → Debouncing → Running → Evaluating → Watching
//!                                                  any → Stopped
//! ```
//!
//! `Running` is only entered from the pipeline task's loop body, so two test
//! runs never overlap. Triggers that arrive while a run is in flight wait in
//! the trigger channel and are merged into a single follow-up run.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{
    EventBus, PipelineEvent, TestsFailedEvent, UserNotifiedEvent, DEFAULT_EVENT_CAPACITY,
};
use crate::notifier::{Notifier, NullSink};
use crate::runner::TestRunner;
use crate::state::{JsonFileStore, NotificationStateStore, RecordStore, StateReader};
use crate::types::{ChangeEvent, FailureSignature, TestRunResult, TestStatus, Trigger};
use crate::utils::debounce::ChangeDebouncer;
use crate::utils::path_filter::PathFilter;
use crate::watcher::{FileWatcher, WatchSetupError};

/// Capacity of the channel carrying debounced triggers to the pipeline.
const TRIGGER_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the channel between the file watcher and the debouncer.
const CHANGE_CHANNEL_CAPACITY: usize = 1000;

const CONTROL_CHANNEL_CAPACITY: usize = 8;

/// Lifecycle state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Watching,
    Debouncing,
    Running,
    Evaluating,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Watching => "watching",
            Self::Debouncing => "debouncing",
            Self::Running => "running",
            Self::Evaluating => "evaluating",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Observable state of a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct WatcherState {
    pub pipeline: PipelineState,
    /// Result of the most recent completed run.
    pub last_result: Option<Arc<TestRunResult>>,
    /// True while a follow-up run for changes made during a run is pending.
    pub pending_rerun: bool,
    pub runs_completed: u64,
}

impl WatcherState {
    fn watching() -> Self {
        Self {
            pipeline: PipelineState::Watching,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
enum Control {
    Clear(oneshot::Sender<()>),
    Acknowledge(FailureSignature, oneshot::Sender<bool>),
}

/// Assembles an [`Orchestrator`] from its components.
#[derive(Debug)]
pub struct OrchestratorBuilder {
    config: Config,
    notifier: Option<Notifier>,
    record_store: Option<Box<dyn RecordStore>>,
    event_capacity: usize,
}

impl OrchestratorBuilder {
    /// Uses `notifier` instead of the one derived from the configured channel.
    #[must_use]
    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Uses `store` instead of the JSON file under the state directory.
    #[must_use]
    pub fn record_store(mut self, store: Box<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    /// Sets how many undelivered events a slow subscriber may fall behind.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let notifier = match self.notifier {
            Some(notifier) => notifier,
            None => Notifier::from_config(&config).unwrap_or_else(|e| {
                warn!(error = %e, "Notification channel unusable, notifications disabled");
                Notifier::new(NullSink)
            }),
        };
        let record_store = self
            .record_store
            .unwrap_or_else(|| Box::new(JsonFileStore::new(config.state_file())));

        Orchestrator {
            runner: TestRunner::from_config(&config),
            notifier,
            store: NotificationStateStore::new(record_store),
            events: EventBus::with_capacity(self.event_capacity),
            config,
        }
    }
}

/// The assembled pipeline, ready to start.
#[derive(Debug)]
pub struct Orchestrator {
    config: Config,
    runner: TestRunner,
    notifier: Notifier,
    store: NotificationStateStore,
    events: EventBus,
}

impl Orchestrator {
    #[must_use]
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            notifier: None,
            record_store: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribes to pipeline events before the pipeline starts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Runs the test command once, outside the watch loop.
    ///
    /// No notification is sent and the notification state is untouched.
    pub async fn test_once(&self) -> TestRunResult {
        self.runner
            .run(&self.config.test_command, &self.config.project_dir)
            .await
    }

    /// Starts watching and spawns the pipeline task.
    ///
    /// # Errors
    ///
    /// Returns `WatchSetupError` if an exclusion pattern is invalid or a
    /// watched path cannot be registered. Nothing keeps running in that case.
    pub async fn start(self) -> Result<OrchestratorHandle, WatchSetupError> {
        let roots: Vec<PathBuf> = if self.config.watched_paths.is_empty() {
            vec![self.config.project_dir.clone()]
        } else {
            self.config.watched_paths.clone()
        };
        let filter = PathFilter::new(&self.config.exclude_paths, &roots)?;

        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let debouncer = ChangeDebouncer::new(self.config.debounce(), filter.clone(), trigger_tx);

        let (change_tx, change_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        let watcher = match FileWatcher::start(&roots, change_tx).await {
            Ok(watcher) => watcher,
            Err(e) => {
                debouncer.cancel();
                return Err(e);
            }
        };

        let (state_tx, state_rx) = watch::channel(WatcherState::watching());
        let state_tx = Arc::new(state_tx);
        let tap = tokio::spawn(forward_changes(
            change_rx,
            debouncer.sender(),
            filter,
            Arc::clone(&state_tx),
        ));

        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let reader = self.store.reader();
        let events = self.events.clone();

        info!(
            paths = ?roots,
            command = %self.config.test_command,
            debounce_ms = self.config.debounce_ms,
            channel = self.notifier.channel_name(),
            "Watching for changes"
        );

        let pipeline = Pipeline {
            config: self.config,
            runner: self.runner,
            notifier: self.notifier,
            store: self.store,
            events: self.events,
            state_tx,
            cancel: cancel.clone(),
        };
        let resources = Resources {
            watcher,
            debouncer,
            tap,
        };
        let task = tokio::spawn(pipeline.run(trigger_rx, control_rx, resources));

        Ok(OrchestratorHandle {
            control_tx,
            cancel,
            state_rx,
            events,
            reader,
            task: Some(task),
        })
    }
}

/// Handle to a running pipeline.
///
/// Dropping the handle stops the pipeline.
#[derive(Debug)]
pub struct OrchestratorHandle {
    control_tx: mpsc::Sender<Control>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<WatcherState>,
    events: EventBus,
    reader: StateReader,
    task: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    /// Current pipeline state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state_rx.borrow().pipeline
    }

    /// Snapshot of the full watcher state.
    #[must_use]
    pub fn watcher_state(&self) -> WatcherState {
        self.state_rx.borrow().clone()
    }

    /// Receiver that observes every watcher state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<WatcherState> {
        self.state_rx.clone()
    }

    /// Result of the most recent completed run.
    #[must_use]
    pub fn last_result(&self) -> Option<Arc<TestRunResult>> {
        self.state_rx.borrow().last_result.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Read access to notification records.
    #[must_use]
    pub fn state_reader(&self) -> StateReader {
        self.reader.clone()
    }

    /// Token that stops the pipeline when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Forgets notification history and resets the watcher state.
    ///
    /// Waits until the pipeline has applied the reset; a run in flight
    /// finishes first. Returns false if the pipeline has stopped.
    pub async fn clear(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.control_tx.send(Control::Clear(tx)).await.is_err() {
            return false;
        }
        rx.await.is_ok()
    }

    /// Marks the record for `signature` as acknowledged.
    ///
    /// Returns false if there is no such record or the pipeline has stopped.
    pub async fn acknowledge(&self, signature: FailureSignature) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .control_tx
            .send(Control::Acknowledge(signature, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stops the pipeline and waits for it to shut down.
    ///
    /// A test run in flight is terminated within the kill grace period.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Waits until the pipeline stops, e.g. after the cancellation token fires.
    pub async fn join(mut self) {
        self.wait().await;
    }

    async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Pipeline task ended abnormally");
            }
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Components that only need to live as long as the pipeline.
struct Resources {
    watcher: FileWatcher,
    debouncer: ChangeDebouncer,
    tap: JoinHandle<()>,
}

impl Resources {
    fn shutdown(self) {
        self.watcher.stop();
        self.debouncer.cancel();
        self.tap.abort();
    }
}

struct Pipeline {
    config: Config,
    runner: TestRunner,
    notifier: Notifier,
    store: NotificationStateStore,
    events: EventBus,
    state_tx: Arc<watch::Sender<WatcherState>>,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(
        mut self,
        mut trigger_rx: mpsc::Receiver<Trigger>,
        mut control_rx: mpsc::Receiver<Control>,
        resources: Resources,
    ) {
        let mut running = true;
        if self.config.run_on_start {
            let initial = Trigger {
                change_count: 0,
                paths: Vec::new(),
                fired_at: Utc::now(),
            };
            running = self.run_cycle(initial, &mut trigger_rx).await;
        }

        while running {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(control) = control_rx.recv() => self.handle_control(control),

                trigger = trigger_rx.recv() => match trigger {
                    Some(trigger) => running = self.run_cycle(trigger, &mut trigger_rx).await,
                    None => {
                        warn!("Trigger channel closed, stopping pipeline");
                        break;
                    }
                },
            }
        }

        resources.shutdown();
        self.set_pipeline(PipelineState::Stopped);
        info!("Stopped watching");
    }

    /// Runs the tests for `trigger` plus one merged run per batch of triggers
    /// that queued up meanwhile. Returns false if the pipeline was stopped.
    async fn run_cycle(&mut self, trigger: Trigger, trigger_rx: &mut mpsc::Receiver<Trigger>) -> bool {
        let mut trigger = trigger;
        loop {
            self.state_tx.send_modify(|state| {
                state.pipeline = PipelineState::Running;
                state.pending_rerun = false;
            });
            debug!(
                changes = trigger.change_count,
                paths = trigger.paths.len(),
                "Starting test run"
            );

            let result = self
                .runner
                .run_cancellable(&self.config.test_command, &self.config.project_dir, &self.cancel)
                .await;
            if self.cancel.is_cancelled() {
                return false;
            }

            self.set_pipeline(PipelineState::Evaluating);
            self.evaluate(result).await;

            match drain_triggers(trigger_rx) {
                Some(next) => {
                    info!(
                        changes = next.change_count,
                        "Files changed during the run, running again"
                    );
                    self.state_tx.send_modify(|state| state.pending_rerun = true);
                    trigger = next;
                }
                None => break,
            }
        }

        self.set_pipeline(PipelineState::Watching);
        true
    }

    async fn evaluate(&mut self, result: TestRunResult) {
        let result = Arc::new(result);
        self.state_tx.send_modify(|state| {
            state.last_result = Some(Arc::clone(&result));
            state.runs_completed += 1;
        });

        if result.status == TestStatus::Pass {
            info!("Tests passing");
            self.store.resolve();
            return;
        }

        self.events
            .publish(PipelineEvent::TestsFailed(TestsFailedEvent {
                result: (*result).clone(),
            }));

        let signature = result.signature();
        let notify = self.store.should_notify(&signature);
        self.store.observe_failure(signature.clone());

        if !notify {
            info!(
                signature = %signature.short(),
                failures = result.failures.len(),
                "Failure unchanged, notification suppressed"
            );
            return;
        }

        if self.notifier.notify(&result).await.is_delivered() {
            self.store.mark_notified(signature.clone());
            self.events
                .publish(PipelineEvent::UserNotified(UserNotifiedEvent { signature }));
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Clear(reply) => {
                self.store.clear();
                self.state_tx.send_replace(WatcherState::watching());
                let _ = reply.send(());
            }
            Control::Acknowledge(signature, reply) => {
                let found = self.store.acknowledge(&signature);
                let _ = reply.send(found);
            }
        }
    }

    fn set_pipeline(&self, pipeline: PipelineState) {
        self.state_tx.send_modify(|state| state.pipeline = pipeline);
    }
}

/// Merges every trigger already queued into one.
fn drain_triggers(trigger_rx: &mut mpsc::Receiver<Trigger>) -> Option<Trigger> {
    let mut merged: Option<Trigger> = None;
    while let Ok(trigger) = trigger_rx.try_recv() {
        match merged.as_mut() {
            Some(existing) => existing.merge(trigger),
            None => merged = Some(trigger),
        }
    }
    merged
}

/// Forwards watcher events to the debouncer, flagging the start of a burst.
async fn forward_changes(
    mut change_rx: mpsc::Receiver<ChangeEvent>,
    debouncer_tx: mpsc::Sender<ChangeEvent>,
    filter: PathFilter,
    state_tx: Arc<watch::Sender<WatcherState>>,
) {
    while let Some(event) = change_rx.recv().await {
        if !filter.is_excluded(&event.path) {
            state_tx.send_if_modified(|state| {
                if state.pipeline == PipelineState::Watching {
                    state.pipeline = PipelineState::Debouncing;
                    true
                } else {
                    false
                }
            });
        }
        if debouncer_tx.send(event).await.is_err() {
            break;
        }
    }
}
