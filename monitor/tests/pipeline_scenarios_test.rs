//! End-to-end tests for the watch pipeline.
//!
//! Each test starts a real orchestrator on a temporary project directory,
//! drives it with file changes and shell commands, and observes it through
//! pipeline events, the watcher state and a recording notification sink.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use testwatch_monitor::config::{Config, NotificationChannel};
use testwatch_monitor::events::PipelineEvent;
use testwatch_monitor::notifier::{NotificationError, NotificationMessage, NotificationSink, Notifier};
use testwatch_monitor::orchestrator::{Orchestrator, OrchestratorHandle, PipelineState};
use testwatch_monitor::state::MemoryStore;
use testwatch_monitor::types::{
    FailureSignature, NotificationRecord, TestStatus, TIMEOUT_EXIT_CODE,
};

const WAIT: Duration = Duration::from_secs(10);

const TWO_FAILURES: &str =
    "echo 'test math::adds ... FAILED'; echo 'test math::divides ... FAILED'; exit 101";

// =============================================================================
// Test Helpers
// =============================================================================

/// Sink that remembers every message it was asked to deliver.
#[derive(Debug, Clone, Default)]
struct RecordingSink {
    messages: Arc<Mutex<Vec<NotificationMessage>>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<NotificationMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn deliver<'a>(
        &'a self,
        message: &'a NotificationMessage,
    ) -> BoxFuture<'a, Result<(), NotificationError>> {
        Box::pin(async move {
            self.messages.lock().unwrap().push(message.clone());
            Ok(())
        })
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    sink: RecordingSink,
    store: MemoryStore,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    fn with_store(store: MemoryStore) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        Self {
            _dir: dir,
            root,
            sink: RecordingSink::default(),
            store,
        }
    }

    fn config(&self, command: &str) -> Config {
        let mut config = Config::new(command, &self.root);
        config.debounce_ms = 100;
        config.test_timeout_ms = 10_000;
        config.kill_grace_ms = 200;
        config.notification_channel = NotificationChannel::None;
        config.run_on_start = false;
        config
    }

    fn orchestrator(&self, config: Config) -> Orchestrator {
        Orchestrator::builder(config)
            .notifier(Notifier::new(self.sink.clone()))
            .record_store(Box::new(self.store.clone()))
            .build()
    }

    fn touch(&self, name: &str) {
        std::fs::write(self.root.join(name), Utc::now().to_rfc3339()).unwrap();
    }
}

/// Waits until `runs` runs have completed and the pipeline is idle again.
async fn wait_for_runs(handle: &OrchestratorHandle, runs: u64) {
    let mut rx = handle.watch_state();
    timeout(
        WAIT,
        rx.wait_for(|s| {
            s.runs_completed >= runs
                && matches!(s.pipeline, PipelineState::Watching | PipelineState::Debouncing)
        }),
    )
    .await
    .expect("timed out waiting for test runs")
    .expect("pipeline state channel closed");
}

async fn wait_for_state(handle: &OrchestratorHandle, state: PipelineState) {
    let mut rx = handle.watch_state();
    timeout(WAIT, rx.wait_for(|s| s.pipeline == state))
        .await
        .expect("timed out waiting for pipeline state")
        .expect("pipeline state channel closed");
}

async fn next_event(rx: &mut broadcast::Receiver<PipelineEvent>) -> PipelineEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn drain_events(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn marker_command(marker: &Path) -> String {
    format!(
        "if [ -f '{}' ]; then exit 0; else echo 'test flaky::one ... FAILED'; exit 1; fi",
        marker.display()
    )
}

// =============================================================================
// Scenarios
// =============================================================================

/// A passing run sends nothing and clears records left from earlier failures.
#[tokio::test]
async fn test_passing_run_clears_records() {
    let stale = NotificationRecord::new(FailureSignature::from_raw("stale"));
    let harness = Harness::with_store(MemoryStore::with_records(vec![stale]));
    let mut config = harness.config("exit 0");
    config.run_on_start = true;

    let handle = harness.orchestrator(config).start().await.unwrap();
    wait_for_runs(&handle, 1).await;

    let result = handle.last_result().unwrap();
    assert_eq!(result.status, TestStatus::Pass);
    assert!(result.failures.is_empty());
    assert!(harness.sink.messages().is_empty());
    assert!(harness.store.snapshot().is_empty());
    assert!(handle.state_reader().last_signature().is_none());

    handle.stop().await;
}

/// Two failing tests produce one notification and one TestsFailed event.
#[tokio::test]
async fn test_new_failure_notifies_once() {
    let harness = Harness::new();
    let mut config = harness.config(TWO_FAILURES);
    config.run_on_start = true;

    let orchestrator = harness.orchestrator(config);
    let mut events = orchestrator.subscribe();
    let handle = orchestrator.start().await.unwrap();

    match next_event(&mut events).await {
        PipelineEvent::TestsFailed(event) => {
            let ids: Vec<&str> = event
                .result
                .failures
                .iter()
                .map(|f| f.test_identifier.as_str())
                .collect();
            assert_eq!(ids, vec!["math::adds", "math::divides"]);
            assert_eq!(event.result.exit_code, 101);
        }
        other => panic!("expected TestsFailed, got {other:?}"),
    }

    let signature = match next_event(&mut events).await {
        PipelineEvent::UserNotified(event) => event.signature,
        other => panic!("expected UserNotified, got {other:?}"),
    };

    wait_for_runs(&handle, 1).await;
    let messages = harness.sink.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].title, "Tests failing (2)");
    assert_eq!(messages[0].signature, signature);

    let records = harness.store.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].signature, signature);
    assert!(!records[0].acknowledged);

    handle.stop().await;
}

/// A second run with the same failures is not notified again.
#[tokio::test]
async fn test_repeated_failure_is_suppressed() {
    let harness = Harness::new();
    let mut config = harness.config(TWO_FAILURES);
    config.run_on_start = true;

    let orchestrator = harness.orchestrator(config);
    let mut events = orchestrator.subscribe();
    let handle = orchestrator.start().await.unwrap();
    wait_for_runs(&handle, 1).await;

    harness.touch("lib.rs");
    wait_for_runs(&handle, 2).await;

    assert_eq!(harness.sink.messages().len(), 1);
    assert_eq!(harness.store.snapshot().len(), 1);

    let events = drain_events(&mut events);
    let failed = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::TestsFailed(_)))
        .count();
    let notified = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::UserNotified(_)))
        .count();
    assert_eq!(failed, 2);
    assert_eq!(notified, 1);

    handle.stop().await;
}

/// A run that exceeds the timeout is reported as a failure and notified.
#[tokio::test]
async fn test_timeout_is_reported_as_failure() {
    let harness = Harness::new();
    let mut config = harness.config("sleep 30");
    config.test_timeout_ms = 300;
    config.run_on_start = true;

    let handle = harness.orchestrator(config).start().await.unwrap();
    wait_for_runs(&handle, 1).await;

    let result = handle.last_result().unwrap();
    assert_eq!(result.status, TestStatus::Fail);
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].test_identifier, "timeout");

    let messages = harness.sink.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].exit_code, TIMEOUT_EXIT_CODE);

    handle.stop().await;
}

/// Three changes 10 ms apart lead to exactly one run after the quiet period.
#[tokio::test]
async fn test_change_burst_runs_once_after_quiet_period() {
    let harness = Harness::new();
    let mut config = harness.config("exit 0");
    config.debounce_ms = 200;

    let handle = harness.orchestrator(config).start().await.unwrap();

    harness.touch("a.rs");
    sleep(Duration::from_millis(10)).await;
    harness.touch("b.rs");
    sleep(Duration::from_millis(10)).await;
    let last_change = Utc::now();
    harness.touch("c.rs");

    wait_for_runs(&handle, 1).await;
    sleep(Duration::from_millis(600)).await;

    let state = handle.watcher_state();
    assert_eq!(state.runs_completed, 1);
    let started_at = state.last_result.unwrap().started_at;
    assert!(
        started_at - last_change >= chrono::Duration::milliseconds(200),
        "run started {}ms after the last change",
        (started_at - last_change).num_milliseconds()
    );

    handle.stop().await;
}

// =============================================================================
// State Transitions
// =============================================================================

/// Fail → Pass → Fail with the same tests notifies twice.
#[tokio::test]
async fn test_recurring_failure_after_fix_notifies_again() {
    let harness = Harness::new();
    let markers = TempDir::new().unwrap();
    let marker = markers.path().join("passing");
    let mut config = harness.config(&marker_command(&marker));
    config.run_on_start = true;

    let handle = harness.orchestrator(config).start().await.unwrap();
    wait_for_runs(&handle, 1).await;
    assert_eq!(harness.sink.messages().len(), 1);

    std::fs::write(&marker, "").unwrap();
    harness.touch("fix.rs");
    wait_for_runs(&handle, 2).await;
    assert!(handle.last_result().unwrap().passed());
    assert!(harness.store.snapshot().is_empty());

    std::fs::remove_file(&marker).unwrap();
    harness.touch("break.rs");
    wait_for_runs(&handle, 3).await;

    let messages = harness.sink.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].signature, messages[1].signature);

    handle.stop().await;
}

/// Clearing forgets history so the same failure is notified again.
#[tokio::test]
async fn test_clear_resets_history() {
    let harness = Harness::new();
    let mut config = harness.config(TWO_FAILURES);
    config.run_on_start = true;

    let handle = harness.orchestrator(config).start().await.unwrap();
    wait_for_runs(&handle, 1).await;
    assert_eq!(harness.sink.messages().len(), 1);

    assert!(handle.clear().await);
    assert!(harness.store.snapshot().is_empty());
    let state = handle.watcher_state();
    assert_eq!(state.runs_completed, 0);
    assert!(state.last_result.is_none());
    assert_eq!(state.pipeline, PipelineState::Watching);

    harness.touch("lib.rs");
    wait_for_runs(&handle, 1).await;
    assert_eq!(harness.sink.messages().len(), 2);

    handle.stop().await;
}

/// Acknowledging through the handle updates the persisted record.
#[tokio::test]
async fn test_acknowledge_through_handle() {
    let harness = Harness::new();
    let mut config = harness.config(TWO_FAILURES);
    config.run_on_start = true;

    let handle = harness.orchestrator(config).start().await.unwrap();
    wait_for_runs(&handle, 1).await;

    let signature = handle.state_reader().last_signature().unwrap();
    assert!(handle.acknowledge(signature.clone()).await);
    assert!(harness.store.snapshot()[0].acknowledged);
    assert!(!handle.state_reader().is_notified(&signature));
    assert!(
        !handle
            .acknowledge(FailureSignature::from_raw("unknown"))
            .await
    );

    handle.stop().await;
}

/// Changes made while a run is in flight produce exactly one follow-up run.
#[tokio::test]
async fn test_changes_during_run_coalesce_into_one_rerun() {
    let harness = Harness::new();
    let mut config = harness.config("sleep 0.6; exit 0");
    config.debounce_ms = 50;
    config.run_on_start = true;

    let handle = harness.orchestrator(config).start().await.unwrap();
    wait_for_state(&handle, PipelineState::Running).await;

    for name in ["one.rs", "two.rs", "three.rs"] {
        harness.touch(name);
        sleep(Duration::from_millis(100)).await;
    }

    wait_for_runs(&handle, 2).await;
    sleep(Duration::from_millis(900)).await;
    assert_eq!(handle.watcher_state().runs_completed, 2);

    handle.stop().await;
}

/// Excluded paths never trigger a run.
#[tokio::test]
async fn test_excluded_changes_are_ignored() {
    let harness = Harness::new();
    let config = harness.config("exit 0");

    let handle = harness.orchestrator(config).start().await.unwrap();
    std::fs::create_dir(harness.root.join("target")).unwrap();
    harness.touch("target/output.o");

    sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.watcher_state().runs_completed, 0);

    handle.stop().await;
}

/// Stopping during a run terminates the test command promptly.
#[tokio::test]
async fn test_stop_terminates_running_command() {
    let harness = Harness::new();
    let mut config = harness.config("sleep 30");
    config.run_on_start = true;

    let handle = harness.orchestrator(config).start().await.unwrap();
    wait_for_state(&handle, PipelineState::Running).await;
    assert_eq!(handle.state(), PipelineState::Running);
    let state_rx = handle.watch_state();

    let started = std::time::Instant::now();
    handle.stop().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(state_rx.borrow().pipeline, PipelineState::Stopped);
    assert_eq!(state_rx.borrow().runs_completed, 0);
    assert!(harness.sink.messages().is_empty());
}
