//! Notification suppression state.
//!
//! [`NotificationStateStore`] decides whether a failure is worth telling the
//! user about. A signature is notifiable when no unacknowledged record exists
//! for it, or when the previous failing run had a different signature.
//! Repeated runs of the same unresolved failure therefore notify once.
//!
//! Records are persisted through a [`RecordStore`] so suppression survives a
//! restart. Persistence failures are logged; the in-memory state stays
//! authoritative.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{FailureSignature, NotificationRecord};

/// Errors from loading or saving notification records.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Reading or writing the state file failed.
    #[error("state file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state file does not contain valid records.
    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Backing storage for notification records.
pub trait RecordStore: Send + Sync + fmt::Debug {
    /// Loads all records. A missing store yields an empty list.
    fn load(&self) -> Result<Vec<NotificationRecord>, StoreError>;

    /// Replaces the stored records with `records`.
    fn save(&self, records: &[NotificationRecord]) -> Result<(), StoreError>;
}

/// Stores records as a pretty-printed JSON array.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash never leaves a half-written file behind.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl RecordStore for JsonFileStore {
    fn load(&self) -> Result<Vec<NotificationRecord>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, records: &[NotificationRecord]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), records = records.len(), "Saved notification records");
        Ok(())
    }
}

/// In-memory record storage. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<NotificationRecord>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `records`.
    #[must_use]
    pub fn with_records(records: Vec<NotificationRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
        }
    }

    /// Returns a copy of the records last saved.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NotificationRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl RecordStore for MemoryStore {
    fn load(&self) -> Result<Vec<NotificationRecord>, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, records: &[NotificationRecord]) -> Result<(), StoreError> {
        let mut guard = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = records.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StateInner {
    records: Vec<NotificationRecord>,
    last_signature: Option<FailureSignature>,
}

impl StateInner {
    fn has_active(&self, signature: &FailureSignature) -> bool {
        self.records
            .iter()
            .any(|r| &r.signature == signature && !r.acknowledged)
    }
}

fn read_inner(inner: &RwLock<StateInner>) -> RwLockReadGuard<'_, StateInner> {
    match inner.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_inner(inner: &RwLock<StateInner>) -> RwLockWriteGuard<'_, StateInner> {
    match inner.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Read-only view of the notification state, shareable across tasks.
#[derive(Debug, Clone)]
pub struct StateReader {
    inner: Arc<RwLock<StateInner>>,
}

impl StateReader {
    /// Snapshot of all records.
    #[must_use]
    pub fn records(&self) -> Vec<NotificationRecord> {
        read_inner(&self.inner).records.clone()
    }

    /// Returns true if an unacknowledged record exists for `signature`.
    #[must_use]
    pub fn is_notified(&self, signature: &FailureSignature) -> bool {
        read_inner(&self.inner).has_active(signature)
    }

    /// Signature of the most recent failing run, if the suite is failing.
    #[must_use]
    pub fn last_signature(&self) -> Option<FailureSignature> {
        read_inner(&self.inner).last_signature.clone()
    }
}

/// Tracks which failure signatures the user has been told about.
///
/// Mutated only by the pipeline task; other readers go through
/// [`StateReader`].
#[derive(Debug)]
pub struct NotificationStateStore {
    inner: Arc<RwLock<StateInner>>,
    store: Box<dyn RecordStore>,
}

impl NotificationStateStore {
    /// Loads persisted records from `store`.
    ///
    /// A store that cannot be read is logged and treated as empty. The most
    /// recently notified unacknowledged record becomes the previous run's
    /// signature, so a restart does not repeat the last notification.
    #[must_use]
    pub fn new(store: Box<dyn RecordStore>) -> Self {
        let records = match store.load() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to load notification records, starting empty");
                Vec::new()
            }
        };
        let last_signature = records
            .iter()
            .filter(|r| !r.acknowledged)
            .max_by_key(|r| r.notified_at)
            .map(|r| r.signature.clone());

        debug!(records = records.len(), "Loaded notification state");
        Self {
            inner: Arc::new(RwLock::new(StateInner {
                records,
                last_signature,
            })),
            store,
        }
    }

    /// Creates a store that keeps records in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    /// Returns a cloneable read handle.
    #[must_use]
    pub fn reader(&self) -> StateReader {
        StateReader {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns true if a failure with `signature` should reach the user.
    #[must_use]
    pub fn should_notify(&self, signature: &FailureSignature) -> bool {
        let inner = read_inner(&self.inner);
        !inner.has_active(signature) || inner.last_signature.as_ref() != Some(signature)
    }

    /// Records that the user was notified about `signature`.
    pub fn mark_notified(&mut self, signature: FailureSignature) {
        {
            let mut inner = write_inner(&self.inner);
            inner.records.retain(|r| r.signature != signature);
            inner.records.push(NotificationRecord::new(signature.clone()));
        }
        info!(signature = %signature.short(), "Marked failure as notified");
        self.persist();
    }

    /// Remembers `signature` as the previous failing run's signature.
    pub fn observe_failure(&mut self, signature: FailureSignature) {
        write_inner(&self.inner).last_signature = Some(signature);
    }

    /// The suite went green: drops every record and the previous signature.
    pub fn resolve(&mut self) {
        let had_records = {
            let mut inner = write_inner(&self.inner);
            inner.last_signature = None;
            let had_records = !inner.records.is_empty();
            inner.records.clear();
            had_records
        };
        if had_records {
            info!("Failures resolved, notification records cleared");
            self.persist();
        }
    }

    /// Marks the record for `signature` as acknowledged.
    ///
    /// Returns false if no record exists for it.
    pub fn acknowledge(&mut self, signature: &FailureSignature) -> bool {
        let found = {
            let mut inner = write_inner(&self.inner);
            match inner.records.iter_mut().find(|r| &r.signature == signature) {
                Some(record) => {
                    record.acknowledged = true;
                    true
                }
                None => false,
            }
        };
        if found {
            info!(signature = %signature.short(), "Acknowledged failure");
            self.persist();
        }
        found
    }

    /// Forgets every record, making all signatures notifiable again.
    pub fn clear(&mut self) {
        {
            let mut inner = write_inner(&self.inner);
            inner.records.clear();
            inner.last_signature = None;
        }
        info!("Notification state cleared");
        self.persist();
    }

    /// Snapshot of all records.
    #[must_use]
    pub fn records(&self) -> Vec<NotificationRecord> {
        read_inner(&self.inner).records.clone()
    }

    fn persist(&self) {
        let records = self.records();
        if let Err(e) = self.store.save(&records) {
            warn!(error = %e, "Failed to persist notification records");
        }
    }
}

/// Finds the record whose signature starts with `prefix`.
///
/// Lets the `ack` command accept the short form printed by `status`.
#[must_use]
pub fn find_by_prefix<'a>(
    records: &'a [NotificationRecord],
    prefix: &str,
) -> Option<&'a NotificationRecord> {
    let mut matches = records
        .iter()
        .filter(|r| r.signature.as_str().starts_with(prefix));
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureEntry;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn sig(ids: &[&str]) -> FailureSignature {
        let failures: Vec<FailureEntry> = ids.iter().map(|id| FailureEntry::new(*id, "")).collect();
        FailureSignature::from_failures(&failures)
    }

    /// Mirrors the pipeline's evaluation of one failing run.
    fn evaluate_failure(store: &mut NotificationStateStore, signature: &FailureSignature) -> bool {
        let notify = store.should_notify(signature);
        store.observe_failure(signature.clone());
        if notify {
            store.mark_notified(signature.clone());
        }
        notify
    }

    #[test]
    fn test_new_signature_is_notifiable() {
        let store = NotificationStateStore::in_memory();
        assert!(store.should_notify(&sig(&["a"])));
    }

    #[test]
    fn test_repeat_failure_is_suppressed() {
        let mut store = NotificationStateStore::in_memory();
        let s = sig(&["a", "b"]);

        assert!(evaluate_failure(&mut store, &s));
        assert!(!evaluate_failure(&mut store, &s));
        assert!(!evaluate_failure(&mut store, &s));
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn test_fail_pass_fail_notifies_again() {
        let mut store = NotificationStateStore::in_memory();
        let s = sig(&["a"]);

        assert!(evaluate_failure(&mut store, &s));
        store.resolve();
        assert!(store.records().is_empty());
        assert!(evaluate_failure(&mut store, &s));
    }

    #[test]
    fn test_changed_signature_notifies() {
        let mut store = NotificationStateStore::in_memory();
        let a = sig(&["a"]);
        let ab = sig(&["a", "b"]);

        assert!(evaluate_failure(&mut store, &a));
        assert!(evaluate_failure(&mut store, &ab));
        // Back to the first set: previous run differs.
        assert!(evaluate_failure(&mut store, &a));
        assert!(!evaluate_failure(&mut store, &a));
    }

    #[test]
    fn test_clear_makes_signature_notifiable() {
        let mut store = NotificationStateStore::in_memory();
        let s = sig(&["a"]);
        evaluate_failure(&mut store, &s);
        assert!(!store.should_notify(&s));

        store.clear();
        assert!(store.should_notify(&s));
        assert!(store.records().is_empty());
    }

    #[test]
    fn test_acknowledge() {
        let mut store = NotificationStateStore::in_memory();
        let s = sig(&["a"]);
        evaluate_failure(&mut store, &s);

        assert!(store.acknowledge(&s));
        assert!(store.records()[0].acknowledged);
        assert!(!store.acknowledge(&sig(&["unknown"])));
        assert!(!store.reader().is_notified(&s));
    }

    #[test]
    fn test_reader_sees_updates() {
        let mut store = NotificationStateStore::in_memory();
        let reader = store.reader();
        let s = sig(&["x"]);

        assert!(reader.last_signature().is_none());
        evaluate_failure(&mut store, &s);
        assert_eq!(reader.last_signature(), Some(s.clone()));
        assert!(reader.is_notified(&s));
        assert_eq!(reader.records().len(), 1);
    }

    #[test]
    fn test_records_written_through_to_store() {
        let backing = MemoryStore::new();
        let mut store = NotificationStateStore::new(Box::new(backing.clone()));
        let s = sig(&["a"]);

        store.mark_notified(s.clone());
        assert_eq!(backing.snapshot().len(), 1);
        assert_eq!(backing.snapshot()[0].signature, s);

        store.resolve();
        assert!(backing.snapshot().is_empty());
    }

    #[test]
    fn test_restart_keeps_suppression() {
        let s = sig(&["a"]);
        let backing = MemoryStore::with_records(vec![NotificationRecord::new(s.clone())]);

        let store = NotificationStateStore::new(Box::new(backing));
        assert!(!store.should_notify(&s));
        assert!(store.should_notify(&sig(&["b"])));
    }

    #[test]
    fn test_json_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("notifications.json");
        let file_store = JsonFileStore::new(&path);

        assert!(file_store.load().unwrap().is_empty());

        let mut record = NotificationRecord::new(sig(&["a"]));
        record.acknowledged = true;
        assert_ok!(file_store.save(&[record.clone()]));

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"notifiedAt\""));
        assert!(contents.contains("\"acknowledged\": true"));
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = file_store.load().unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn test_json_file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notifications.json");
        fs::write(&path, "not json").unwrap();

        let result = JsonFileStore::new(&path).load();
        assert!(matches!(result, Err(StoreError::Json(_))));
    }

    #[test]
    fn test_unreadable_store_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notifications.json");
        fs::write(&path, "[{").unwrap();

        let store = NotificationStateStore::new(Box::new(JsonFileStore::new(&path)));
        assert!(store.records().is_empty());
    }

    #[test]
    fn test_find_by_prefix() {
        let a = NotificationRecord::new(FailureSignature::from_raw("abc123"));
        let b = NotificationRecord::new(FailureSignature::from_raw("abd456"));
        let records = vec![a.clone(), b];

        assert_eq!(find_by_prefix(&records, "abc"), Some(&a));
        assert_eq!(find_by_prefix(&records, "ab"), None);
        assert_eq!(find_by_prefix(&records, "zzz"), None);
    }
}
