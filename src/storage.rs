//! Storage seam: the batch-insert/query interface the engines talk to, plus an in-memory
//! backend used by tests and local runs.

use crate::error::{BridgeError, Result};
use crate::query::SelectQuery;
use crate::types::{QueryRow, SampleRecord};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex};

/// Result of scanning one row: row-level failures are reported per row so the reader can
/// skip them without aborting the request.
pub type RowResult = Result<QueryRow>;

/// A process-wide storage handle shared by the flush thread and concurrent readers.
pub trait SampleStore: Debug + Send + Sync + 'static {
    /// Opens a transaction for one batch of inserts.
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>>;

    /// Executes a translated select. A returned `Err` aborts the read request; per-row
    /// errors are carried inside the vector.
    fn query(&self, query: &SelectQuery) -> Result<Vec<RowResult>>;

    /// Cheap liveness probe used for readiness checks.
    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// One batch transaction. Inserts are parameterized by the record, never by SQL text.
pub trait StoreTransaction {
    fn insert(&mut self, record: &SampleRecord) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Failure injection switches for [`MemoryStore`].
#[derive(Debug, Default)]
struct Faults {
    fail_begin: bool,
    fail_commit: bool,
    /// Zero-based insert ordinals (counted across the store's lifetime) that fail.
    fail_inserts: Vec<u64>,
    fail_query: Option<String>,
    paused: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: Vec<SampleRecord>,
    commits: Vec<usize>,
    insert_attempts: u64,
    queries: Vec<SelectQuery>,
    responses: VecDeque<Vec<RowResult>>,
    faults: Faults,
}

/// In-memory store: keeps committed records, records every query it receives and replays
/// queued responses. Failure injection and a pause gate make the write path observable.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<(Mutex<MemoryState>, Condvar)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record committed so far, in commit order.
    pub fn committed(&self) -> Vec<SampleRecord> {
        self.lock().committed.clone()
    }

    /// Sizes of the committed batches, in commit order.
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.lock().commits.clone()
    }

    /// Every select received, in arrival order.
    pub fn queries(&self) -> Vec<SelectQuery> {
        self.lock().queries.clone()
    }

    /// Queues the rows returned by the next `query` call.
    pub fn push_response(&self, rows: Vec<RowResult>) {
        self.lock().responses.push_back(rows);
    }

    pub fn fail_begin(&self, fail: bool) {
        self.lock().faults.fail_begin = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.lock().faults.fail_commit = fail;
    }

    /// Makes the insert with the given zero-based ordinal fail.
    pub fn fail_insert_at(&self, ordinal: u64) {
        self.lock().faults.fail_inserts.push(ordinal);
    }

    pub fn fail_queries(&self, message: Option<&str>) {
        self.lock().faults.fail_query = message.map(str::to_string);
    }

    /// While paused, `begin` blocks; used to simulate a slow backend.
    pub fn pause(&self) {
        self.lock().faults.paused = true;
    }

    pub fn resume(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut state) = lock.lock() {
            state.faults.paused = false;
        }
        cvar.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned test store is still readable; recover the guard.
        self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SampleStore for MemoryStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock()?;
        while state.faults.paused {
            state = cvar.wait(state)?;
        }
        if state.faults.fail_begin {
            return Err(BridgeError::backend("begin", "injected begin failure"));
        }
        Ok(Box::new(MemoryTransaction {
            store: self,
            pending: Vec::new(),
        }))
    }

    fn query(&self, query: &SelectQuery) -> Result<Vec<RowResult>> {
        let mut state = self.inner.0.lock()?;
        state.queries.push(query.clone());
        if let Some(message) = &state.faults.fail_query {
            return Err(BridgeError::backend("query", message.clone()));
        }
        Ok(state.responses.pop_front().unwrap_or_default())
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    pending: Vec<SampleRecord>,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn insert(&mut self, record: &SampleRecord) -> Result<()> {
        let mut state = self.store.inner.0.lock()?;
        let ordinal = state.insert_attempts;
        state.insert_attempts += 1;
        if state.faults.fail_inserts.contains(&ordinal) {
            return Err(BridgeError::backend(
                "exec",
                format!("injected insert failure at #{}", ordinal),
            ));
        }
        self.pending.push(record.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { store, pending } = *self;
        let mut state = store.inner.0.lock()?;
        if state.faults.fail_commit {
            return Err(BridgeError::backend("commit", "injected commit failure"));
        }
        state.commits.push(pending.len());
        state.committed.extend(pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64) -> SampleRecord {
        SampleRecord {
            name: "up".into(),
            tags: vec!["__name__=up".into()],
            value: ts as f64,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn test_commit_makes_records_visible() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.insert(&record(1)).unwrap();
        tx.insert(&record(2)).unwrap();
        assert!(store.committed().is_empty());
        tx.commit().unwrap();
        assert_eq!(store.committed().len(), 2);
        assert_eq!(store.commit_sizes(), vec![2]);
    }

    #[test]
    fn test_injected_insert_failure_only_hits_one_record() {
        let store = MemoryStore::new();
        store.fail_insert_at(1);
        let mut tx = store.begin().unwrap();
        assert!(tx.insert(&record(1)).is_ok());
        assert!(tx.insert(&record(2)).is_err());
        assert!(tx.insert(&record(3)).is_ok());
        tx.commit().unwrap();
        let ts: Vec<i64> = store.committed().iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(ts, vec![1, 3]);
    }

    #[test]
    fn test_failed_commit_discards_batch() {
        let store = MemoryStore::new();
        store.fail_commit(true);
        let mut tx = store.begin().unwrap();
        tx.insert(&record(1)).unwrap();
        assert!(tx.commit().is_err());
        assert!(store.committed().is_empty());
    }

    #[test]
    fn test_query_replays_responses_in_order() {
        let store = MemoryStore::new();
        store.push_response(vec![Err(BridgeError::RowDecode("bad".into()))]);
        let q = SelectQuery::default();
        assert_eq!(store.query(&q).unwrap().len(), 1);
        assert!(store.query(&q).unwrap().is_empty());
        assert_eq!(store.queries().len(), 2);
    }
}
