//! Core data types for the testwatch pipeline.
//!
//! This module defines the values that flow between the watcher, the
//! debouncer, the test runner and the notification layer. Types that leave
//! the process (persisted records, webhook payloads, events) serialize to
//! camelCase JSON.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Exit code reported for a run that was terminated by the timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Exit code reported when no exit status could be observed: the run was
/// cancelled by a stop request or waiting on the process failed.
pub const NO_EXIT_STATUS_CODE: i32 = -2;

/// Exit code reported when the test command could not be spawned at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Kind of file system change observed by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A single raw change reported by the file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path that changed.
    pub path: PathBuf,
    /// What happened to it.
    pub kind: ChangeKind,
    /// When the watcher saw the change.
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates a change event stamped with the current time.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// A coalesced "re-run tests now" signal produced by the debouncer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Number of raw change events folded into this trigger.
    pub change_count: usize,
    /// Distinct changed paths, in the order they were first seen.
    pub paths: Vec<PathBuf>,
    /// When the quiet period elapsed.
    pub fired_at: DateTime<Utc>,
}

impl Trigger {
    /// Folds another trigger into this one, keeping path order stable.
    pub fn merge(&mut self, other: Trigger) {
        self.change_count += other.change_count;
        for path in other.paths {
            if !self.paths.contains(&path) {
                self.paths.push(path);
            }
        }
        self.fired_at = self.fired_at.max(other.fired_at);
    }
}

/// Overall outcome of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
}

/// One failing test extracted from the runner output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    /// Runner-specific identifier of the failing test.
    pub test_identifier: String,
    /// Failure message, possibly empty.
    pub message: String,
}

impl FailureEntry {
    #[must_use]
    pub fn new(test_identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            test_identifier: test_identifier.into(),
            message: message.into(),
        }
    }
}

/// Result of a single invocation of the test command.
///
/// Built once by the runner and never mutated afterwards; the orchestrator
/// shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunResult {
    pub exit_code: i32,
    pub raw_output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: TestStatus,
    pub failures: Vec<FailureEntry>,
}

impl TestRunResult {
    /// Returns true if the run passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }

    /// Returns true if the run was cut short by the timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Signature of the current failure set.
    #[must_use]
    pub fn signature(&self) -> FailureSignature {
        FailureSignature::from_failures(&self.failures)
    }
}

/// Stable identifier for a set of failing tests.
///
/// The digest covers the deduplicated, sorted test identifiers, so the same
/// failing tests always produce the same signature regardless of the order
/// the runner printed them in. Messages are not included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureSignature(String);

impl FailureSignature {
    /// Computes the signature of a failure list.
    #[must_use]
    pub fn from_failures(failures: &[FailureEntry]) -> Self {
        let mut identifiers: Vec<&str> = failures
            .iter()
            .map(|f| f.test_identifier.as_str())
            .collect();
        identifiers.sort_unstable();
        identifiers.dedup();

        let mut hasher = Sha256::new();
        for id in identifiers {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an already computed signature string (e.g. from the command line).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and notification bodies.
    #[must_use]
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted record of a notification sent for a failure signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub signature: FailureSignature,
    pub notified_at: DateTime<Utc>,
    pub acknowledged: bool,
}

impl NotificationRecord {
    /// Creates an unacknowledged record stamped with the current time.
    #[must_use]
    pub fn new(signature: FailureSignature) -> Self {
        Self {
            signature,
            notified_at: Utc::now(),
            acknowledged: false,
        }
    }
}
