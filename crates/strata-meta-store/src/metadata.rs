//! Metadata manager: the tables, the lock table and the store they share.

use crate::double_buffer::FlushTarget;
use crate::lock::LockManager;
use crate::memory::MemoryStore;
use crate::store::{BatchOp, MetaStore, MetaStoreResult, PersistentStore};
use crate::table::TypedTable;
use crate::tables::TableName;
use std::path::Path;
use std::sync::Arc;
use strata_common::{
    BucketInfo, KEY_SEPARATOR, KeyInfo, LogIndex, VolumeInfo, bucket_key, volume_key,
};
use tracing::info;

pub struct MetadataManager {
    store: Arc<dyn PersistentStore>,
    volumes: TypedTable<VolumeInfo>,
    buckets: TypedTable<BucketInfo>,
    keys: TypedTable<KeyInfo>,
    locks: LockManager,
}

impl MetadataManager {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            volumes: TypedTable::new(TableName::Volumes, Arc::clone(&store)),
            buckets: TypedTable::new(TableName::Buckets, Arc::clone(&store)),
            keys: TypedTable::new(TableName::Keys, Arc::clone(&store)),
            locks: LockManager::new(),
            store,
        }
    }

    /// Open a redb-backed manager
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        let store = MetaStore::open(path)?;
        info!("Opened metadata store at {:?}", path);
        Ok(Self::new(Arc::new(store)))
    }

    /// Manager whose state is lost on exit
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub fn volumes(&self) -> &TypedTable<VolumeInfo> {
        &self.volumes
    }

    pub fn buckets(&self) -> &TypedTable<BucketInfo> {
        &self.buckets
    }

    pub fn keys(&self) -> &TypedTable<KeyInfo> {
        &self.keys
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Highest log index the store holds; 0 for a fresh store
    pub fn durable_index(&self) -> MetaStoreResult<LogIndex> {
        Ok(self
            .store
            .transaction_info()?
            .map_or(0, |info| info.log_index))
    }

    pub fn is_volume_empty(&self, volume: &str) -> MetaStoreResult<bool> {
        let prefix = format!("{}{KEY_SEPARATOR}", volume_key(volume));
        Ok(!self.buckets.has_live_with_prefix(&prefix)?)
    }

    pub fn is_bucket_empty(&self, volume: &str, bucket: &str) -> MetaStoreResult<bool> {
        let prefix = format!("{}{KEY_SEPARATOR}", bucket_key(volume, bucket));
        Ok(!self.keys.has_live_with_prefix(&prefix)?)
    }

    /// Bytes stored by live keys in `volume`, counting every replica
    pub fn volume_bytes_used(&self, volume: &str) -> MetaStoreResult<u64> {
        let prefix = format!("{}{KEY_SEPARATOR}", volume_key(volume));
        Ok(self
            .keys
            .scan_prefix(&prefix)?
            .iter()
            .map(|(_, k)| k.data_size.saturating_mul(u64::from(k.replication_factor)))
            .fold(0u64, u64::saturating_add))
    }
}

impl FlushTarget for MetadataManager {
    fn flush_batch(&self, ops: &[BatchOp], last_index: LogIndex) -> MetaStoreResult<()> {
        self.store.batch_write(ops, last_index)
    }

    fn evict(&self, op: &BatchOp, log_index: LogIndex) {
        match op.table {
            TableName::Volumes => self.volumes.evict(&op.key, log_index),
            TableName::Buckets => self.buckets.evict(&op.key, log_index),
            TableName::Keys => self.keys.evict(&op.key, log_index),
        };
    }
}
