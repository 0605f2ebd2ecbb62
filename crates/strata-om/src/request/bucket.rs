//! Bucket commands

use super::{CacheWrite, Mutation, Plan, RequestContext, RequestHandler, parse_acls, store_error};
use crate::metrics::{Gauge, OmAction};
use crate::response::ResponseBody;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_common::{
    Acl, AclRight, BucketInfo, OmError, OmResult, ResourcePath, StorageType, bucket_key,
    validate_resource_name,
};

fn check_names(volume: &str, bucket: &str) -> OmResult<()> {
    validate_resource_name(volume).map_err(OmError::InvalidVolumeName)?;
    validate_resource_name(bucket).map_err(OmError::InvalidBucketName)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBucketRequest {
    pub volume: String,
    pub bucket: String,
    #[serde(default)]
    pub versioning: bool,
    #[serde(default)]
    pub storage_type: StorageType,
    /// Added on top of the ACLs inherited from the volume
    #[serde(default)]
    pub acls: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub creation_time: u64,
}

impl CreateBucketRequest {
    pub fn new(volume: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            bucket: bucket.into(),
            versioning: false,
            storage_type: StorageType::default(),
            acls: Vec::new(),
            metadata: BTreeMap::new(),
            creation_time: 0,
        }
    }
}

impl RequestHandler for CreateBucketRequest {
    fn action(&self) -> OmAction {
        OmAction::CreateBucket
    }

    fn target(&self) -> ResourcePath {
        ResourcePath::bucket(&self.volume, &self.bucket)
    }

    /// Creating a bucket is a create on its volume
    fn required_access(&self) -> (ResourcePath, AclRight) {
        (ResourcePath::volume(&self.volume), AclRight::Create)
    }

    fn validate(&self) -> OmResult<()> {
        check_names(&self.volume, &self.bucket)?;
        parse_acls(&self.acls).map(|_| ())
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        let existing = ctx.bucket(&self.volume, &self.bucket)?;
        if ctx.is_replay(&existing) {
            return Ok(Plan::Replay);
        }
        if existing.value().is_some() {
            return Err(OmError::BucketAlreadyExists {
                volume: self.volume.clone(),
                bucket: self.bucket.clone(),
            });
        }
        let volume = ctx.require_volume(&self.volume)?;

        let mut acls = volume.acls;
        for acl in parse_acls(&self.acls)? {
            Acl::add_to(&mut acls, &acl);
        }

        let info = BucketInfo {
            volume: self.volume.clone(),
            bucket: self.bucket.clone(),
            acls,
            versioning: self.versioning,
            storage_type: self.storage_type,
            creation_time: self.creation_time,
            metadata: self.metadata.clone(),
            update_id: ctx.log_index,
        };
        Ok(Mutation::new(ResponseBody::Bucket(info.clone()))
            .write(CacheWrite::bucket(info))
            .gauge(Gauge::Buckets, 1)
            .into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBucketPropertyRequest {
    pub volume: String,
    pub bucket: String,
    #[serde(default)]
    pub versioning: Option<bool>,
    #[serde(default)]
    pub storage_type: Option<StorageType>,
}

impl RequestHandler for SetBucketPropertyRequest {
    fn action(&self) -> OmAction {
        OmAction::SetBucketProperty
    }

    fn target(&self) -> ResourcePath {
        ResourcePath::bucket(&self.volume, &self.bucket)
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::Write)
    }

    fn validate(&self) -> OmResult<()> {
        if self.versioning.is_none() && self.storage_type.is_none() {
            return Err(OmError::invalid_request(
                "set bucket property needs versioning or a storage type",
            ));
        }
        Ok(())
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        let existing = ctx.bucket(&self.volume, &self.bucket)?;
        if ctx.is_replay(&existing) {
            return Ok(Plan::Replay);
        }
        let mut info = existing
            .into_value()
            .ok_or_else(|| OmError::bucket_not_found(&self.volume, &self.bucket))?;

        if let Some(versioning) = self.versioning {
            info.versioning = versioning;
        }
        if let Some(storage_type) = self.storage_type {
            info.storage_type = storage_type;
        }
        info.update_id = ctx.log_index;

        Ok(Mutation::new(ResponseBody::Bucket(info.clone()))
            .write(CacheWrite::bucket(info))
            .into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBucketRequest {
    pub volume: String,
    pub bucket: String,
}

impl DeleteBucketRequest {
    pub fn new(volume: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            bucket: bucket.into(),
        }
    }
}

impl RequestHandler for DeleteBucketRequest {
    fn action(&self) -> OmAction {
        OmAction::DeleteBucket
    }

    fn target(&self) -> ResourcePath {
        ResourcePath::bucket(&self.volume, &self.bucket)
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::Delete)
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        let existing = ctx.bucket(&self.volume, &self.bucket)?;
        if ctx.is_replay(&existing) {
            return Ok(Plan::Replay);
        }
        if existing.value().is_none() {
            return Err(OmError::bucket_not_found(&self.volume, &self.bucket));
        }
        if !ctx
            .metadata
            .is_bucket_empty(&self.volume, &self.bucket)
            .map_err(store_error)?
        {
            return Err(OmError::BucketNotEmpty {
                volume: self.volume.clone(),
                bucket: self.bucket.clone(),
            });
        }

        Ok(Mutation::new(ResponseBody::Empty)
            .write(CacheWrite::Bucket(bucket_key(&self.volume, &self.bucket), None))
            .gauge(Gauge::Buckets, -1)
            .into())
    }
}
