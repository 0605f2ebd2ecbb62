//! Command handlers
//!
//! Each command implements [`RequestHandler`]. The handler only decides
//! what should happen: it resolves its target, checks for replays and
//! preconditions, and returns a [`Plan`]. Locking, committing the plan to
//! the cache, flushing, auditing and counting are shared and live in
//! [`crate::manager`].

mod acl;
mod bucket;
mod key;
mod volume;

pub use acl::{AddAclRequest, RemoveAclRequest, SetAclRequest};
pub use bucket::{CreateBucketRequest, DeleteBucketRequest, SetBucketPropertyRequest};
pub use key::{CommitKeyRequest, DeleteKeyRequest};
pub use volume::{CreateVolumeRequest, DeleteVolumeRequest, SetVolumePropertyRequest};

use crate::metrics::{Gauge, OmAction};
use crate::replay::ReplayDetector;
use crate::response::ResponseBody;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_common::{
    Acl, AclRight, BucketInfo, Entity, KeyInfo, LogIndex, OmError, OmResult, ResourcePath,
    ResourceType, UserInfo, VolumeInfo,
};
use strata_meta_store::{
    BatchOp, CacheValue, Lookup, MetaStoreError, MetaStoreResult, MetadataManager, TableName,
    TypedTable,
};
use tracing::error;

/// Every command the object manager applies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OmRequest {
    CreateVolume(CreateVolumeRequest),
    SetVolumeProperty(SetVolumePropertyRequest),
    DeleteVolume(DeleteVolumeRequest),
    CreateBucket(CreateBucketRequest),
    SetBucketProperty(SetBucketPropertyRequest),
    DeleteBucket(DeleteBucketRequest),
    CommitKey(CommitKeyRequest),
    DeleteKey(DeleteKeyRequest),
    AddAcl(AddAclRequest),
    RemoveAcl(RemoveAclRequest),
    SetAcl(SetAclRequest),
}

impl OmRequest {
    pub(crate) fn handler(&self) -> &dyn RequestHandler {
        match self {
            Self::CreateVolume(r) => r,
            Self::SetVolumeProperty(r) => r,
            Self::DeleteVolume(r) => r,
            Self::CreateBucket(r) => r,
            Self::SetBucketProperty(r) => r,
            Self::DeleteBucket(r) => r,
            Self::CommitKey(r) => r,
            Self::DeleteKey(r) => r,
            Self::AddAcl(r) => r,
            Self::RemoveAcl(r) => r,
            Self::SetAcl(r) => r,
        }
    }

    pub fn action(&self) -> OmAction {
        self.handler().action()
    }

    /// Resource the command mutates
    pub fn target(&self) -> ResourcePath {
        self.handler().target()
    }
}

/// Behaviour specific to one command
pub(crate) trait RequestHandler {
    fn action(&self) -> OmAction;

    /// Resource that is write-locked; its ancestors are read-locked
    fn target(&self) -> ResourcePath;

    /// Resource and right checked when ACLs are enabled
    fn required_access(&self) -> (ResourcePath, AclRight);

    /// Ancestors locked exclusively instead of shared
    fn exclusive_ancestors(&self) -> &'static [ResourceType] {
        &[]
    }

    /// Checks that need no metadata; run before any lock is taken
    fn validate(&self) -> OmResult<()> {
        Ok(())
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        path_params(&self.target())
    }

    /// Runs under the locks: resolve the target, detect replays and check
    /// preconditions. Must not touch the cache.
    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan>;
}

/// What a handler sees while holding its locks
pub(crate) struct RequestContext<'a> {
    pub metadata: &'a MetadataManager,
    pub replay: &'a ReplayDetector,
    pub log_index: LogIndex,
    pub user: &'a UserInfo,
}

impl RequestContext<'_> {
    pub fn is_replay<V: Entity>(&self, lookup: &Lookup<V>) -> bool {
        self.replay.check(lookup.version(), self.log_index)
    }

    pub fn volume(&self, volume: &str) -> OmResult<Lookup<VolumeInfo>> {
        self.metadata
            .volumes()
            .lookup(&strata_common::volume_key(volume))
            .map_err(store_error)
    }

    pub fn bucket(&self, volume: &str, bucket: &str) -> OmResult<Lookup<BucketInfo>> {
        self.metadata
            .buckets()
            .lookup(&strata_common::bucket_key(volume, bucket))
            .map_err(store_error)
    }

    pub fn key(&self, volume: &str, bucket: &str, key: &str) -> OmResult<Lookup<KeyInfo>> {
        self.metadata
            .keys()
            .lookup(&strata_common::object_key(volume, bucket, key))
            .map_err(store_error)
    }

    /// Volume that must exist for the command to proceed
    pub fn require_volume(&self, volume: &str) -> OmResult<VolumeInfo> {
        self.volume(volume)?
            .into_value()
            .ok_or_else(|| OmError::VolumeNotFound(volume.to_string()))
    }

    /// Bucket that must exist; a missing volume is reported first
    pub fn require_bucket(&self, volume: &str, bucket: &str) -> OmResult<BucketInfo> {
        match self.bucket(volume, bucket)?.into_value() {
            Some(info) => Ok(info),
            None => {
                self.require_volume(volume)?;
                Err(OmError::bucket_not_found(volume, bucket))
            }
        }
    }
}

/// Decision of a handler
pub(crate) enum Plan {
    /// Already applied; answer success without touching anything
    Replay,
    Mutate(Mutation),
}

/// Cache writes, counter changes and response of a successful command
pub(crate) struct Mutation {
    pub writes: Vec<CacheWrite>,
    pub gauges: Vec<(Gauge, i64)>,
    pub body: ResponseBody,
    pub message: Option<String>,
}

impl Mutation {
    pub fn new(body: ResponseBody) -> Self {
        Self {
            writes: Vec::new(),
            gauges: Vec::new(),
            body,
            message: None,
        }
    }

    #[must_use]
    pub fn write(mut self, write: CacheWrite) -> Self {
        self.writes.push(write);
        self
    }

    #[must_use]
    pub fn gauge(mut self, gauge: Gauge, delta: i64) -> Self {
        self.gauges.push((gauge, delta));
        self
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl From<Mutation> for Plan {
    fn from(mutation: Mutation) -> Self {
        Self::Mutate(mutation)
    }
}

/// New overlay value for one table key; `None` deletes
pub(crate) enum CacheWrite {
    Volume(String, Option<VolumeInfo>),
    Bucket(String, Option<BucketInfo>),
    Key(String, Option<KeyInfo>),
}

impl CacheWrite {
    pub fn volume(info: VolumeInfo) -> Self {
        Self::Volume(strata_common::volume_key(&info.volume), Some(info))
    }

    pub fn bucket(info: BucketInfo) -> Self {
        Self::Bucket(strata_common::bucket_key(&info.volume, &info.bucket), Some(info))
    }

    pub fn key(info: KeyInfo) -> Self {
        Self::Key(
            strata_common::object_key(&info.volume, &info.bucket, &info.key),
            Some(info),
        )
    }

    /// Encoded form handed to the flush pipeline
    pub fn to_batch_op(&self) -> MetaStoreResult<BatchOp> {
        match self {
            Self::Volume(key, value) => encode(TableName::Volumes, key, value.as_ref()),
            Self::Bucket(key, value) => encode(TableName::Buckets, key, value.as_ref()),
            Self::Key(key, value) => encode(TableName::Keys, key, value.as_ref()),
        }
    }

    /// Install into the overlay; false if a newer entry is already there
    pub fn install(self, metadata: &MetadataManager, log_index: LogIndex) -> bool {
        match self {
            Self::Volume(key, value) => metadata
                .volumes()
                .add_cache_entry(key, CacheValue { value, log_index }),
            Self::Bucket(key, value) => metadata
                .buckets()
                .add_cache_entry(key, CacheValue { value, log_index }),
            Self::Key(key, value) => metadata
                .keys()
                .add_cache_entry(key, CacheValue { value, log_index }),
        }
    }

    pub fn table_key(&self) -> &str {
        match self {
            Self::Volume(key, _) | Self::Bucket(key, _) | Self::Key(key, _) => key,
        }
    }
}

fn encode<V>(table: TableName, key: &str, value: Option<&V>) -> MetaStoreResult<BatchOp>
where
    V: Entity + Serialize + serde::de::DeserializeOwned,
{
    Ok(match value {
        Some(v) => BatchOp::put(table, key, TypedTable::encode(v)?),
        None => BatchOp::delete(table, key),
    })
}

/// Store failures surface as internal errors; details stay in the log
pub(crate) fn store_error(e: MetaStoreError) -> OmError {
    error!("Metadata store failure: {}", e);
    OmError::internal(e.to_string())
}

/// Parse ACL text supplied with a command
pub(crate) fn parse_acls(acls: &[String]) -> OmResult<Vec<Acl>> {
    acls.iter()
        .map(|a| {
            a.parse::<Acl>()
                .map_err(|e| OmError::invalid_request(e.to_string()))
        })
        .collect()
}

pub(crate) fn path_params(path: &ResourcePath) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("volume".to_string(), path.volume.clone());
    if let Some(bucket) = &path.bucket {
        params.insert("bucket".to_string(), bucket.clone());
    }
    if let Some(key) = &path.key {
        params.insert("key".to_string(), key.clone());
    }
    params
}

/// Path segments from the volume down to the deepest named resource
pub(crate) fn path_segments(path: &ResourcePath) -> Vec<&str> {
    let mut segments = vec![path.volume.as_str()];
    if let Some(bucket) = path.bucket.as_deref() {
        segments.push(bucket);
        if let Some(key) = path.key.as_deref() {
            segments.push(key);
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_log_format() {
        let line = r#"{"type":"DeleteBucket","volume":"vol1","bucket":"b1"}"#;
        let request: OmRequest = serde_json::from_str(line).unwrap();
        assert_eq!(request.action(), OmAction::DeleteBucket);
        assert_eq!(request.target(), ResourcePath::bucket("vol1", "b1"));

        let line = r#"{"type":"RemoveAcl","resource":{"volume":"vol1","bucket":"b1","key":"k"},"acl":"user:bob:r"}"#;
        let request: OmRequest = serde_json::from_str(line).unwrap();
        assert_eq!(request.action(), OmAction::RemoveAcl);
        assert_eq!(request.target(), ResourcePath::key("vol1", "b1", "k"));
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments(&ResourcePath::volume("v")), vec!["v"]);
        assert_eq!(
            path_segments(&ResourcePath::key("v", "b", "dir/k")),
            vec!["v", "b", "dir/k"]
        );
        let params = path_params(&ResourcePath::bucket("v", "b"));
        assert_eq!(params.get("bucket").map(String::as_str), Some("b"));
        assert!(!params.contains_key("key"));
    }

    #[test]
    fn test_parse_acls() {
        let acls = parse_acls(&["user:alice:rw".to_string(), "world::r".to_string()]).unwrap();
        assert_eq!(acls.len(), 2);
        let err = parse_acls(&["user:alice".to_string()]).unwrap_err();
        assert_eq!(err.result_code(), strata_common::ResultCode::InvalidRequest);
    }
}
