//! Key commands
//!
//! Only the commit of a fully written key and its deletion go through the
//! write path; block allocation happens elsewhere.

use super::{CacheWrite, Mutation, Plan, RequestContext, RequestHandler, parse_acls, store_error};
use crate::metrics::{Gauge, OmAction};
use crate::response::ResponseBody;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_common::{
    Acl, AclRight, KeyInfo, OmError, OmResult, ResourcePath, ResourceType, object_key,
    validate_key_name,
};

const fn default_replication() -> u8 {
    3
}

fn replicated_size(data_size: u64, replication_factor: u8) -> u64 {
    data_size.saturating_mul(u64::from(replication_factor))
}

/// Make a written key visible, creating or replacing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitKeyRequest {
    pub volume: String,
    pub bucket: String,
    pub key: String,
    pub data_size: u64,
    #[serde(default = "default_replication")]
    pub replication_factor: u8,
    /// Added on top of the ACLs inherited from the bucket
    #[serde(default)]
    pub acls: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub modification_time: u64,
}

impl CommitKeyRequest {
    pub fn new(
        volume: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        data_size: u64,
    ) -> Self {
        Self {
            volume: volume.into(),
            bucket: bucket.into(),
            key: key.into(),
            data_size,
            replication_factor: default_replication(),
            acls: Vec::new(),
            metadata: BTreeMap::new(),
            modification_time: 0,
        }
    }
}

impl RequestHandler for CommitKeyRequest {
    fn action(&self) -> OmAction {
        OmAction::CommitKey
    }

    fn target(&self) -> ResourcePath {
        ResourcePath::key(&self.volume, &self.bucket, &self.key)
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::Write)
    }

    /// The quota check reads usage of the whole volume
    fn exclusive_ancestors(&self) -> &'static [ResourceType] {
        &[ResourceType::Volume]
    }

    fn validate(&self) -> OmResult<()> {
        validate_key_name(&self.key).map_err(OmError::InvalidKeyName)?;
        if self.replication_factor == 0 {
            return Err(OmError::invalid_request(
                "replication factor must be at least 1",
            ));
        }
        parse_acls(&self.acls).map(|_| ())
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        let mut params = super::path_params(&self.target());
        params.insert("data_size".to_string(), self.data_size.to_string());
        params.insert(
            "replication_factor".to_string(),
            self.replication_factor.to_string(),
        );
        params
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        let existing = ctx.key(&self.volume, &self.bucket, &self.key)?;
        if ctx.is_replay(&existing) {
            return Ok(Plan::Replay);
        }
        let volume = ctx.require_volume(&self.volume)?;
        let bucket = ctx.require_bucket(&self.volume, &self.bucket)?;
        let previous = existing.into_value();

        let used = ctx
            .metadata
            .volume_bytes_used(&self.volume)
            .map_err(store_error)?;
        let released = previous
            .as_ref()
            .map_or(0, |k| replicated_size(k.data_size, k.replication_factor));
        let required = used
            .saturating_sub(released)
            .saturating_add(replicated_size(self.data_size, self.replication_factor));
        if required > volume.quota_in_bytes {
            return Err(OmError::QuotaExceeded {
                volume: self.volume.clone(),
                quota: volume.quota_in_bytes,
                required,
            });
        }

        let created = previous.is_none();
        let (creation_time, mut acls) = match previous {
            Some(old) => (old.creation_time, old.acls),
            None => (self.modification_time, bucket.acls),
        };
        for acl in parse_acls(&self.acls)? {
            Acl::add_to(&mut acls, &acl);
        }

        let info = KeyInfo {
            volume: self.volume.clone(),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            data_size: self.data_size,
            replication_factor: self.replication_factor,
            creation_time,
            modification_time: self.modification_time,
            acls,
            metadata: self.metadata.clone(),
            update_id: ctx.log_index,
        };
        let mut mutation =
            Mutation::new(ResponseBody::Key(info.clone())).write(CacheWrite::key(info));
        if created {
            mutation = mutation.gauge(Gauge::Keys, 1);
        }
        Ok(mutation.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteKeyRequest {
    pub volume: String,
    pub bucket: String,
    pub key: String,
}

impl DeleteKeyRequest {
    pub fn new(
        volume: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            volume: volume.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl RequestHandler for DeleteKeyRequest {
    fn action(&self) -> OmAction {
        OmAction::DeleteKey
    }

    fn target(&self) -> ResourcePath {
        ResourcePath::key(&self.volume, &self.bucket, &self.key)
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::Delete)
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        let existing = ctx.key(&self.volume, &self.bucket, &self.key)?;
        if ctx.is_replay(&existing) {
            return Ok(Plan::Replay);
        }
        if existing.value().is_none() {
            ctx.require_bucket(&self.volume, &self.bucket)?;
            return Err(OmError::key_not_found(&self.volume, &self.bucket, &self.key));
        }

        Ok(Mutation::new(ResponseBody::Empty)
            .write(CacheWrite::Key(
                object_key(&self.volume, &self.bucket, &self.key),
                None,
            ))
            .gauge(Gauge::Keys, -1)
            .into())
    }
}
