use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use triage_core::{Clock, Entry, SystemClock, validate_entry};

use crate::control::{
    ControlStatsSource, ControlTransaction, Transactor, ensure_presubmit_unchanged, ensure_unique,
};
use crate::StoreError;

type EntryKey = (String, String);

/// In-process ingestion control store. Transactions hold the store lock
/// for their whole duration, so they are serializable.
pub struct MemoryControlStore {
    entries: Mutex<BTreeMap<EntryKey, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryControlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.lock().map_err(|_| StoreError::Poisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

struct MemoryTransaction<'a> {
    committed: &'a BTreeMap<EntryKey, Entry>,
    pending: BTreeMap<EntryKey, Entry>,
    commit_time: DateTime<Utc>,
}

impl MemoryTransaction<'_> {
    fn lookup(&self, key: &EntryKey) -> Option<&Entry> {
        self.pending.get(key).or_else(|| self.committed.get(key))
    }
}

impl ControlTransaction for MemoryTransaction<'_> {
    fn read(&self, project: &str, build_ids: &[String]) -> Result<Vec<Option<Entry>>, StoreError> {
        ensure_unique(build_ids)?;
        Ok(build_ids
            .iter()
            .map(|build_id| {
                self.lookup(&(project.to_owned(), build_id.clone()))
                    .cloned()
            })
            .collect())
    }

    fn insert_or_update(&mut self, entry: &Entry) -> Result<(), StoreError> {
        validate_entry(entry)?;

        let key = (entry.project.clone(), entry.build_id.clone());
        let existing = self.lookup(&key);
        ensure_presubmit_unchanged(existing.map(|existing| existing.is_presubmit), entry)?;
        let creation_time = existing
            .and_then(|existing| existing.creation_time)
            .unwrap_or(self.commit_time);

        let mut stored = entry.clone();
        stored.creation_time = Some(creation_time);
        stored.last_updated = Some(self.commit_time);
        self.pending.insert(key, stored);
        Ok(())
    }

    fn commit_time(&self) -> DateTime<Utc> {
        self.commit_time
    }
}

impl Transactor for MemoryControlStore {
    fn read_then_write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut dyn ControlTransaction) -> Result<T, E>,
    {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;

        let mut tx = MemoryTransaction {
            committed: &entries,
            pending: BTreeMap::new(),
            commit_time: self.clock.now(),
        };
        let value = f(&mut tx)?;
        let MemoryTransaction { pending, .. } = tx;

        entries.extend(pending);
        Ok(value)
    }
}

impl ControlStatsSource for MemoryControlStore {
    fn presubmit_entries_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Entry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .values()
            .filter(|entry| entry.is_presubmit)
            .filter(|entry| entry.creation_time.is_some_and(|created| created >= since))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::{Duration, TimeZone};
    use triage_core::{BuildResult, ManualClock};

    use super::*;

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid time")
    }

    fn entry(build: i64) -> Entry {
        let mut entry = Entry::new("testproject", format!("host/{build}"));
        entry.build_result = Some(BuildResult {
            host: "host".to_owned(),
            id: build,
            creation_time: Some(start_time()),
            project: "testproject".to_owned(),
        });
        entry
    }

    #[test]
    fn writes_are_visible_within_the_transaction_and_after_commit() {
        let store = MemoryControlStore::with_clock(Arc::new(ManualClock::new(start_time())));

        let seen: Result<_, StoreError> = store.read_then_write(|tx| {
            tx.insert_or_update(&entry(1))?;
            tx.read("testproject", &["host/1".to_owned()])
        });
        let seen = seen.expect("transaction");
        assert_eq!(
            seen[0].as_ref().and_then(|e| e.creation_time),
            Some(start_time())
        );

        let read = store
            .read("testproject", &["host/1".to_owned(), "host/2".to_owned()])
            .expect("read");
        assert!(read[0].is_some());
        assert!(read[1].is_none());
        assert_eq!(store.len().expect("len"), 1);
    }

    #[test]
    fn failed_transactions_discard_pending_writes() {
        let store = MemoryControlStore::new();
        let result: Result<(), StoreError> = store.read_then_write(|tx| {
            tx.insert_or_update(&entry(1))?;
            Err(StoreError::InvalidInput("abort".to_owned()))
        });
        assert!(result.is_err());
        assert!(store.is_empty().expect("is_empty"));
    }

    #[test]
    fn update_preserves_creation_time() {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = MemoryControlStore::with_clock(clock.clone());

        let insert: Result<(), StoreError> =
            store.read_then_write(|tx| tx.insert_or_update(&entry(1)));
        insert.expect("insert");

        clock.advance(Duration::seconds(30));
        let update: Result<(), StoreError> =
            store.read_then_write(|tx| tx.insert_or_update(&entry(1)));
        update.expect("update");

        let stored = store
            .read("testproject", &["host/1".to_owned()])
            .expect("read")
            .remove(0)
            .expect("present");
        assert_eq!(stored.creation_time, Some(start_time()));
        assert_eq!(
            stored.last_updated,
            Some(start_time() + Duration::seconds(30))
        );
    }

    #[test]
    fn presubmit_flag_cannot_change() {
        let store = MemoryControlStore::new();
        let insert: Result<(), StoreError> =
            store.read_then_write(|tx| tx.insert_or_update(&entry(1)));
        insert.expect("insert");

        let mut flipped = entry(1);
        flipped.is_presubmit = true;
        let update: Result<(), StoreError> =
            store.read_then_write(|tx| tx.insert_or_update(&flipped));
        assert!(matches!(update, Err(StoreError::Conflict(_))));

        let stored = store
            .read("testproject", &["host/1".to_owned()])
            .expect("read")
            .remove(0)
            .expect("present");
        assert!(!stored.is_presubmit);
    }

    #[test]
    fn concurrent_read_modify_writes_are_serialized() {
        let store = Arc::new(MemoryControlStore::new());
        let initial: Result<(), StoreError> =
            store.read_then_write(|tx| tx.insert_or_update(&Entry::new("testproject", "host/1")));
        initial.expect("seed");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let result: Result<(), StoreError> = store.read_then_write(|tx| {
                        let mut current = tx
                            .read("testproject", &["host/1".to_owned()])?
                            .remove(0)
                            .unwrap_or_else(|| Entry::new("testproject", "host/1"));
                        let id = current.build_result.as_ref().map_or(0, |r| r.id) + 1;
                        current.build_result = Some(BuildResult {
                            host: "host".to_owned(),
                            id,
                            creation_time: Some(Utc::now()),
                            project: "testproject".to_owned(),
                        });
                        tx.insert_or_update(&current)
                    });
                    result.expect("increment");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }

        let stored = store
            .read("testproject", &["host/1".to_owned()])
            .expect("read")
            .remove(0)
            .expect("present");
        assert_eq!(stored.build_result.map(|r| r.id), Some(8));
    }
}
