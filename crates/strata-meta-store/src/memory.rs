//! In-memory store for ephemeral nodes and tests.
//!
//! Besides holding data it can slow down or fail batch writes on demand,
//! which is how flush pipeline behaviour under a slow or broken disk is
//! exercised.

use crate::store::{BatchOp, MetaStoreError, MetaStoreResult, PersistentStore, TransactionInfo};
use crate::tables::TableName;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use strata_common::LogIndex;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<TableName, BTreeMap<String, Vec<u8>>>,
    info: Option<TransactionInfo>,
}

type ScanHook = Box<dyn FnOnce() + Send>;

/// `PersistentStore` kept entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    write_delay: Mutex<Duration>,
    fail_writes: AtomicBool,
    batches: AtomicU64,
    scan_hook: Mutex<Option<ScanHook>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every batch write
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Make batch writes fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` once, right after the next prefix scan has read its rows
    pub fn on_next_scan(&self, hook: impl FnOnce() + Send + 'static) {
        *self.scan_hook.lock() = Some(Box::new(hook));
    }

    /// Number of successfully committed batches
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Number of durable entries in a table
    pub fn len(&self, table: TableName) -> usize {
        self.state.read().tables.get(&table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().tables.values().all(BTreeMap::is_empty)
    }
}

impl PersistentStore for MemoryStore {
    fn batch_write(&self, ops: &[BatchOp], last_index: LogIndex) -> MetaStoreResult<()> {
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MetaStoreError::Unavailable(format!(
                "injected failure writing batch up to log index {last_index}"
            )));
        }

        let mut state = self.state.write();
        for op in ops {
            let table = state.tables.entry(op.table).or_default();
            match &op.value {
                Some(bytes) => {
                    table.insert(op.key.clone(), bytes.clone());
                }
                None => {
                    table.remove(&op.key);
                }
            }
        }
        state.info = Some(TransactionInfo {
            log_index: last_index,
        });
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, table: TableName, key: &str) -> MetaStoreResult<Option<Vec<u8>>> {
        Ok(self
            .state
            .read()
            .tables
            .get(&table)
            .and_then(|t| t.get(key).cloned()))
    }

    fn scan_prefix(
        &self,
        table: TableName,
        prefix: &str,
    ) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        let rows = {
            let state = self.state.read();
            state.tables.get(&table).map_or_else(Vec::new, |table| {
                table
                    .range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
        };
        let hook = self.scan_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(rows)
    }

    fn transaction_info(&self) -> MetaStoreResult<Option<TransactionInfo>> {
        Ok(self.state.read().info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_failure_leaves_state_untouched() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .batch_write(&[BatchOp::put(TableName::Volumes, "/vol1", vec![1])], 5)
            .unwrap_err();
        assert!(matches!(err, MetaStoreError::Unavailable(_)));
        assert!(store.is_empty());
        assert_eq!(store.transaction_info().unwrap(), None);

        store.set_fail_writes(false);
        store
            .batch_write(&[BatchOp::put(TableName::Volumes, "/vol1", vec![1])], 5)
            .unwrap();
        assert_eq!(store.len(TableName::Volumes), 1);
        assert_eq!(store.batch_count(), 1);
    }

    #[test]
    fn test_scan_prefix() {
        let store = MemoryStore::new();
        store
            .batch_write(
                &[
                    BatchOp::put(TableName::Buckets, "/vol1/a", vec![]),
                    BatchOp::put(TableName::Buckets, "/vol11/a", vec![]),
                    BatchOp::put(TableName::Buckets, "/vol1/b", vec![]),
                ],
                1,
            )
            .unwrap();
        let found = store.scan_prefix(TableName::Buckets, "/vol1/").unwrap();
        assert_eq!(found.len(), 2);
        assert!(store.scan_prefix(TableName::Keys, "/").unwrap().is_empty());
    }
}
