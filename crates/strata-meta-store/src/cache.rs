//! Versioned overlay cache in front of one persistent table.
//!
//! Every entry carries the log index of the transaction that wrote it. An
//! absent value is a tombstone: the key was deleted by that transaction
//! but the delete has not reached the store yet, so reads must not fall
//! through to the stale durable row.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::LogIndex;

/// Cached value tagged with the log index that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue<V> {
    pub value: Option<V>,
    pub log_index: LogIndex,
}

impl<V> CacheValue<V> {
    pub fn present(value: V, log_index: LogIndex) -> Self {
        Self {
            value: Some(value),
            log_index,
        }
    }

    pub fn tombstone(log_index: LogIndex) -> Self {
        Self {
            value: None,
            log_index,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Overlay cache for one table
pub struct TableCache<V> {
    entries: RwLock<BTreeMap<String, CacheValue<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> Default for TableCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> TableCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<CacheValue<V>> {
        let found = self.entries.read().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Install `value` unless the entry already holds an equal or newer
    /// index. Returns whether the entry was written.
    pub fn put(&self, key: impl Into<String>, value: CacheValue<V>) -> bool {
        let mut entries = self.entries.write();
        let key = key.into();
        if let Some(existing) = entries.get(&key) {
            if existing.log_index >= value.log_index {
                return false;
            }
        }
        entries.insert(key, value);
        true
    }

    /// Drop the entry if the store now covers it (index ≤ `flushed_upto`).
    /// Newer entries written after the flushed batch stay.
    pub fn evict(&self, key: &str, flushed_upto: LogIndex) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(existing) if existing.log_index <= flushed_upto => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Entries whose key starts with `prefix`, tombstones included
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, CacheValue<V>)> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_requires_newer_index() {
        let cache = TableCache::new();
        assert!(cache.put("/vol1", CacheValue::present("a", 5)));
        assert!(!cache.put("/vol1", CacheValue::present("b", 5)));
        assert!(!cache.put("/vol1", CacheValue::present("c", 3)));
        assert_eq!(cache.get("/vol1").unwrap().value, Some("a"));

        assert!(cache.put("/vol1", CacheValue::tombstone(6)));
        let entry = cache.get("/vol1").unwrap();
        assert!(entry.is_tombstone());
        assert_eq!(entry.log_index, 6);
    }

    #[test]
    fn test_evict_keeps_newer_entries() {
        let cache = TableCache::new();
        cache.put("/vol1/b1", CacheValue::present(1, 10));
        assert!(!cache.evict("/vol1/b1", 9));
        assert_eq!(cache.len(), 1);
        assert!(cache.evict("/vol1/b1", 10));
        assert!(cache.is_empty());
        assert!(!cache.evict("/vol1/b1", 10));
    }

    #[test]
    fn test_scan_prefix_includes_tombstones() {
        let cache = TableCache::new();
        cache.put("/vol1/b1/k1", CacheValue::present(1, 1));
        cache.put("/vol1/b1/k2", CacheValue::tombstone(2));
        cache.put("/vol1/b2/k1", CacheValue::present(3, 3));

        let found = cache.scan_prefix("/vol1/b1/");
        assert_eq!(found.len(), 2);
        assert!(found[1].1.is_tombstone());
    }

    #[test]
    fn test_stats() {
        let cache: TableCache<u8> = TableCache::new();
        cache.put("a", CacheValue::present(1, 1));
        cache.get("a");
        cache.get("b");
        assert_eq!(cache.stats(), (1, 1));
    }
}
