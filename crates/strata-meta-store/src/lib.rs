//! Strata Metadata Store - write-path storage layer of the object manager
//!
//! ```text
//!  request handlers ──lock──▶ LockManager
//!        │
//!        ├──get/put──▶ TypedTable ──▶ TableCache (overlay, wins if present)
//!        │                  └────────▶ PersistentStore (redb)
//!        │
//!        └──add──▶ DoubleBuffer ──drain thread──▶ PersistentStore::batch_write
//!                                         └──────▶ TableCache::evict
//! ```
//!
//! Handlers mutate the overlay cache while holding the resource write lock
//! and hand the encoded mutation to the double buffer. The drain thread
//! persists batches in log index order and evicts the overlay entries that
//! the store now covers.

pub mod cache;
pub mod double_buffer;
pub mod lock;
pub mod memory;
pub mod metadata;
pub mod store;
pub mod table;
pub mod tables;

// Re-exports
pub use cache::{CacheValue, TableCache};
pub use double_buffer::{DoubleBuffer, DoubleBufferStats, FlushError, FlushFuture, FlushTarget};
pub use lock::{LockError, LockGuard, LockManager, LockMode};
pub use memory::MemoryStore;
pub use metadata::MetadataManager;
pub use store::{
    BatchOp, MetaStore, MetaStoreError, MetaStoreResult, PersistentStore, TransactionInfo,
};
pub use table::{Lookup, TypedTable};
pub use tables::TableName;
