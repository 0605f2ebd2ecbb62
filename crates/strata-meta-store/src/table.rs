//! Typed table: overlay cache plus bincode-encoded persistent rows.

use crate::cache::{CacheValue, TableCache};
use crate::store::{MetaStoreResult, PersistentStore};
use crate::tables::TableName;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use strata_common::{Entity, LogIndex};
use tracing::error;

/// Result of a point lookup, remembering where the answer came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Overlay entry, possibly a tombstone
    Cached(CacheValue<V>),
    /// Durable row with no overlay entry
    Stored(V),
    Absent,
}

impl<V: Entity> Lookup<V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Cached(cv) => cv.value.as_ref(),
            Self::Stored(v) => Some(v),
            Self::Absent => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Cached(cv) => cv.value,
            Self::Stored(v) => Some(v),
            Self::Absent => None,
        }
    }

    /// Log index of the last mutation visible for this key. Tombstones
    /// count, so a replayed delete is still recognised after the entity is
    /// gone from the overlay's point of view.
    pub fn version(&self) -> Option<LogIndex> {
        match self {
            Self::Cached(cv) => Some(cv.log_index),
            Self::Stored(v) => Some(v.update_id()),
            Self::Absent => None,
        }
    }
}

/// One metadata table
pub struct TypedTable<V> {
    name: TableName,
    cache: TableCache<V>,
    store: Arc<dyn PersistentStore>,
}

impl<V> TypedTable<V>
where
    V: Entity + Serialize + DeserializeOwned,
{
    pub fn new(name: TableName, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            name,
            cache: TableCache::new(),
            store,
        }
    }

    pub fn name(&self) -> TableName {
        self.name
    }

    pub fn cache(&self) -> &TableCache<V> {
        &self.cache
    }

    /// Overlay first; fall through to the store only on a cache miss
    pub fn lookup(&self, key: &str) -> MetaStoreResult<Lookup<V>> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(Lookup::Cached(cached));
        }
        match self.store.read(self.name, key)? {
            Some(bytes) => Ok(Lookup::Stored(self.decode(key, &bytes)?)),
            None => Ok(Lookup::Absent),
        }
    }

    pub fn get(&self, key: &str) -> MetaStoreResult<Option<V>> {
        Ok(self.lookup(key)?.into_value())
    }

    pub fn exists(&self, key: &str) -> MetaStoreResult<bool> {
        Ok(self.lookup(key)?.value().is_some())
    }

    pub fn add_cache_entry(&self, key: impl Into<String>, value: CacheValue<V>) -> bool {
        self.cache.put(key, value)
    }

    pub fn evict(&self, key: &str, flushed_upto: LogIndex) -> bool {
        self.cache.evict(key, flushed_upto)
    }

    /// Live entries under `prefix`. Overlay entries replace durable rows and
    /// overlay tombstones hide them.
    ///
    /// The overlay is read before the store: an entry evicted in between
    /// has already been written, so it shows up in one of the two reads.
    pub fn scan_prefix(&self, prefix: &str) -> MetaStoreResult<Vec<(String, V)>> {
        let mut merged: BTreeMap<String, Option<V>> = self
            .cache
            .scan_prefix(prefix)
            .into_iter()
            .map(|(key, cached)| (key, cached.value))
            .collect();
        for (key, bytes) in self.store.scan_prefix(self.name, prefix)? {
            if merged.contains_key(&key) {
                continue;
            }
            let value = self.decode(&key, &bytes)?;
            merged.insert(key, Some(value));
        }
        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    /// Whether any live entry exists under `prefix`
    pub fn has_live_with_prefix(&self, prefix: &str) -> MetaStoreResult<bool> {
        let mut shadowed = HashSet::new();
        for (key, cached) in self.cache.scan_prefix(prefix) {
            if cached.value.is_some() {
                return Ok(true);
            }
            shadowed.insert(key);
        }
        Ok(self
            .store
            .scan_prefix(self.name, prefix)?
            .into_iter()
            .any(|(key, _)| !shadowed.contains(&key)))
    }

    pub fn encode(value: &V) -> MetaStoreResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> MetaStoreResult<V> {
        bincode::deserialize(bytes).map_err(|e| {
            error!("Failed to decode {} entry '{}': {}", self.name, key, e);
            e.into()
        })
    }
}
