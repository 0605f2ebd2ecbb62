//! Persistent metadata store backed by redb.
//!
//! The store only sees whole batches from the flush pipeline. Every batch is
//! one write transaction that also records the highest log index it covers,
//! so after a restart the store never holds half of a batch and the
//! transaction info tells which log entries are already durable.

use crate::tables::{self, TableName};
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_common::LogIndex;
use tracing::{debug, error};

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Highest log index whose effects are durable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub log_index: LogIndex,
}

/// One mutation inside a flush batch. `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOp {
    pub table: TableName,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl BatchOp {
    pub fn put(table: TableName, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            table,
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn delete(table: TableName, key: impl Into<String>) -> Self {
        Self {
            table,
            key: key.into(),
            value: None,
        }
    }
}

/// Durable key-value backend underneath the overlay cache.
///
/// `batch_write` must be atomic: either every op and the new transaction
/// info become visible, or none do.
pub trait PersistentStore: Send + Sync {
    fn batch_write(&self, ops: &[BatchOp], last_index: LogIndex) -> MetaStoreResult<()>;

    fn read(&self, table: TableName, key: &str) -> MetaStoreResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, table: TableName, prefix: &str)
    -> MetaStoreResult<Vec<(String, Vec<u8>)>>;

    fn transaction_info(&self) -> MetaStoreResult<Option<TransactionInfo>>;
}

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            for name in TableName::ALL {
                let _t = write_txn.open_table(name.definition())?;
            }
            let _t = write_txn.open_table(tables::META)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl PersistentStore for MetaStore {
    fn batch_write(&self, ops: &[BatchOp], last_index: LogIndex) -> MetaStoreResult<()> {
        let info = bincode::serialize(&TransactionInfo {
            log_index: last_index,
        })?;
        let write_txn = self.db.begin_write()?;
        {
            let mut volumes = write_txn.open_table(tables::VOLUMES)?;
            let mut buckets = write_txn.open_table(tables::BUCKETS)?;
            let mut keys = write_txn.open_table(tables::KEYS)?;
            for op in ops {
                let table = match op.table {
                    TableName::Volumes => &mut volumes,
                    TableName::Buckets => &mut buckets,
                    TableName::Keys => &mut keys,
                };
                match &op.value {
                    Some(bytes) => {
                        table.insert(op.key.as_str(), bytes.as_slice())?;
                    }
                    None => {
                        table.remove(op.key.as_str())?;
                    }
                }
            }
            let mut meta = write_txn.open_table(tables::META)?;
            meta.insert(tables::TRANSACTION_INFO_KEY, info.as_slice())?;
        }
        write_txn.commit()?;
        debug!("Committed {} ops up to log index {}", ops.len(), last_index);
        Ok(())
    }

    fn read(&self, table: TableName, key: &str) -> MetaStoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table.definition())?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan_prefix(
        &self,
        table: TableName,
        prefix: &str,
    ) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table.definition())?;
        let mut result = Vec::new();
        for entry in table.range(prefix..)? {
            let entry = entry?;
            let k = entry.0.value();
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.to_string(), entry.1.value().to_vec()));
        }
        Ok(result)
    }

    fn transaction_info(&self) -> MetaStoreResult<Option<TransactionInfo>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::META)?;
        match table.get(tables::TRANSACTION_INFO_KEY)? {
            Some(val) => match bincode::deserialize(val.value()) {
                Ok(info) => Ok(Some(info)),
                Err(e) => {
                    error!("Failed to decode transaction info: {}", e);
                    Err(e.into())
                }
            },
            None => Ok(None),
        }
    }
}
