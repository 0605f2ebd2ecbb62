//! Entity types for the object manager
//!
//! Volumes contain buckets, buckets contain keys. Every entity records the
//! log index of the last command that mutated it in `update_id`.

use crate::acl::Acl;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Position of a command in the replicated log
pub type LogIndex = u64;

/// Separator used to build canonical table keys
pub const KEY_SEPARATOR: char = '/';

/// Canonical key of a volume: `/volume`
#[must_use]
pub fn volume_key(volume: &str) -> String {
    format!("{KEY_SEPARATOR}{volume}")
}

/// Canonical key of a bucket: `/volume/bucket`
#[must_use]
pub fn bucket_key(volume: &str, bucket: &str) -> String {
    format!("{KEY_SEPARATOR}{volume}{KEY_SEPARATOR}{bucket}")
}

/// Canonical key of an object key: `/volume/bucket/key`
#[must_use]
pub fn object_key(volume: &str, bucket: &str, key: &str) -> String {
    format!("{KEY_SEPARATOR}{volume}{KEY_SEPARATOR}{bucket}{KEY_SEPARATOR}{key}")
}

/// Resource types known to the lock manager and the authorizer.
///
/// The declaration order is the global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Volume,
    Bucket,
    Key,
}

impl ResourceType {
    pub const ALL: [Self; 3] = [Self::Volume, Self::Bucket, Self::Key];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volume => "VOLUME",
            Self::Bucket => "BUCKET",
            Self::Key => "KEY",
        }
    }

    /// Position in the global lock order
    #[must_use]
    pub fn order(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hierarchical path of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    pub volume: String,
    pub bucket: Option<String>,
    pub key: Option<String>,
}

impl ResourcePath {
    pub fn volume(volume: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            bucket: None,
            key: None,
        }
    }

    pub fn bucket(volume: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            bucket: Some(bucket.into()),
            key: None,
        }
    }

    pub fn key(
        volume: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            volume: volume.into(),
            bucket: Some(bucket.into()),
            key: Some(key.into()),
        }
    }

    /// Deepest resource type named by this path
    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        match (&self.bucket, &self.key) {
            (Some(_), Some(_)) => ResourceType::Key,
            (Some(_), None) => ResourceType::Bucket,
            _ => ResourceType::Volume,
        }
    }

    /// Canonical table key for this path
    #[must_use]
    pub fn table_key(&self) -> String {
        match (&self.bucket, &self.key) {
            (Some(b), Some(k)) => object_key(&self.volume, b, k),
            (Some(b), None) => bucket_key(&self.volume, b),
            _ => volume_key(&self.volume),
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_key())
    }
}

/// Identity of the caller that issued a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_name: String,
    #[serde(default)]
    pub remote_address: Option<String>,
}

impl UserInfo {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            remote_address: None,
        }
    }

    #[must_use]
    pub fn with_remote_address(mut self, addr: impl Into<String>) -> Self {
        self.remote_address = Some(addr.into());
        self
    }
}

/// Storage media hint for a bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    #[default]
    Disk,
    Ssd,
    Archive,
}

/// Volume metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume: String,
    pub owner: String,
    pub admin: String,
    pub quota_in_bytes: u64,
    pub creation_time: u64,
    pub acls: Vec<Acl>,
    pub metadata: BTreeMap<String, String>,
    pub update_id: LogIndex,
}

/// Bucket metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub volume: String,
    pub bucket: String,
    pub acls: Vec<Acl>,
    pub versioning: bool,
    pub storage_type: StorageType,
    pub creation_time: u64,
    pub metadata: BTreeMap<String, String>,
    pub update_id: LogIndex,
}

/// Key metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub volume: String,
    pub bucket: String,
    pub key: String,
    pub data_size: u64,
    pub replication_factor: u8,
    pub creation_time: u64,
    pub modification_time: u64,
    pub acls: Vec<Acl>,
    pub metadata: BTreeMap<String, String>,
    pub update_id: LogIndex,
}

/// Entities stored in the metadata tables
pub trait Entity: Clone + Send + Sync + 'static {
    /// Log index of the last command that mutated this entity
    fn update_id(&self) -> LogIndex;

    fn set_update_id(&mut self, index: LogIndex);

    fn acls(&self) -> &[Acl];

    fn acls_mut(&mut self) -> &mut Vec<Acl>;
}

macro_rules! impl_entity {
    ($ty:ty) => {
        impl Entity for $ty {
            fn update_id(&self) -> LogIndex {
                self.update_id
            }

            fn set_update_id(&mut self, index: LogIndex) {
                self.update_id = index;
            }

            fn acls(&self) -> &[Acl] {
                &self.acls
            }

            fn acls_mut(&mut self) -> &mut Vec<Acl> {
                &mut self.acls
            }
        }
    };
}

impl_entity!(VolumeInfo);
impl_entity!(BucketInfo);
impl_entity!(KeyInfo);

/// Validate a volume or bucket name.
///
/// Names are 3-63 characters of lowercase letters, digits, `-` and `.`,
/// must start and end with a letter or digit, and cannot look like an
/// IPv4 address.
pub fn validate_resource_name(name: &str) -> Result<(), NameError> {
    if name.len() < 3 {
        return Err(NameError::TooShort);
    }
    if name.len() > 63 {
        return Err(NameError::TooLong);
    }

    let bytes = name.as_bytes();
    let boundary_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !boundary_ok(bytes[0]) {
        return Err(NameError::InvalidStartChar);
    }
    if !boundary_ok(bytes[bytes.len() - 1]) {
        return Err(NameError::InvalidEndChar);
    }

    for c in name.chars() {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '.' {
            return Err(NameError::InvalidChar(c));
        }
    }

    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return Err(NameError::AdjacentSeparators);
    }

    if name.parse::<std::net::Ipv4Addr>().is_ok() {
        return Err(NameError::LooksLikeIpAddress);
    }

    Ok(())
}

/// Validate an object key name
pub fn validate_key_name(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("key name cannot be empty".to_string());
    }
    if key.len() > 1024 {
        return Err("key name must be at most 1024 bytes".to_string());
    }
    Ok(())
}

/// Errors that can occur when validating a volume or bucket name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must be at least 3 characters")]
    TooShort,
    #[error("name must be at most 63 characters")]
    TooLong,
    #[error("name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("name must end with a lowercase letter or number")]
    InvalidEndChar,
    #[error("name contains invalid character: {0}")]
    InvalidChar(char),
    #[error("name cannot contain adjacent periods or hyphens next to periods")]
    AdjacentSeparators,
    #[error("name cannot be formatted as an IP address")]
    LooksLikeIpAddress,
}
