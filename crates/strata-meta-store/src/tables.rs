//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;
use std::fmt;

// Namespace
pub const VOLUMES: TableDefinition<&str, &[u8]> = TableDefinition::new("volumes");
pub const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");
pub const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");

// Bookkeeping
// Key: TRANSACTION_INFO_KEY, Value: bincode-encoded TransactionInfo
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const TRANSACTION_INFO_KEY: &str = "#TRANSACTIONINFO";

/// Logical tables that requests mutate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableName {
    Volumes,
    Buckets,
    Keys,
}

impl TableName {
    pub const ALL: [Self; 3] = [Self::Volumes, Self::Buckets, Self::Keys];

    #[must_use]
    pub fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Self::Volumes => VOLUMES,
            Self::Buckets => BUCKETS,
            Self::Keys => KEYS,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volumes => "volumes",
            Self::Buckets => "buckets",
            Self::Keys => "keys",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
