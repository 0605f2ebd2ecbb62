//! Volume commands

use super::{CacheWrite, Mutation, Plan, RequestContext, RequestHandler, parse_acls, store_error};
use crate::metrics::{Gauge, OmAction};
use crate::response::ResponseBody;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_common::{
    Acl, AclIdentityType, AclRight, AclRights, OmError, OmResult, ResourcePath, VolumeInfo,
    validate_resource_name, volume_key,
};

const fn unlimited_quota() -> u64 {
    u64::MAX
}

fn check_volume_name(volume: &str) -> OmResult<()> {
    validate_resource_name(volume).map_err(OmError::InvalidVolumeName)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub volume: String,
    pub owner: String,
    /// Defaults to the caller
    #[serde(default)]
    pub admin: String,
    #[serde(default = "unlimited_quota")]
    pub quota_in_bytes: u64,
    #[serde(default)]
    pub acls: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub creation_time: u64,
}

impl CreateVolumeRequest {
    pub fn new(volume: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            owner: owner.into(),
            admin: String::new(),
            quota_in_bytes: unlimited_quota(),
            acls: Vec::new(),
            metadata: BTreeMap::new(),
            creation_time: 0,
        }
    }
}

impl RequestHandler for CreateVolumeRequest {
    fn action(&self) -> OmAction {
        OmAction::CreateVolume
    }

    fn target(&self) -> ResourcePath {
        ResourcePath::volume(&self.volume)
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::Create)
    }

    fn validate(&self) -> OmResult<()> {
        check_volume_name(&self.volume)?;
        if self.owner.is_empty() {
            return Err(OmError::invalid_request("volume owner is required"));
        }
        parse_acls(&self.acls).map(|_| ())
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        let existing = ctx.volume(&self.volume)?;
        if ctx.is_replay(&existing) {
            return Ok(Plan::Replay);
        }
        if existing.value().is_some() {
            return Err(OmError::VolumeAlreadyExists(self.volume.clone()));
        }

        let mut acls = parse_acls(&self.acls)?;
        let owner_acl = Acl::new(
            AclIdentityType::User,
            &self.owner,
            AclRights::empty().with(AclRight::All),
        );
        Acl::add_to(&mut acls, &owner_acl);

        let admin = if self.admin.is_empty() {
            ctx.user.user_name.clone()
        } else {
            self.admin.clone()
        };
        let info = VolumeInfo {
            volume: self.volume.clone(),
            owner: self.owner.clone(),
            admin,
            quota_in_bytes: self.quota_in_bytes,
            creation_time: self.creation_time,
            acls,
            metadata: self.metadata.clone(),
            update_id: ctx.log_index,
        };
        Ok(Mutation::new(ResponseBody::Volume(info.clone()))
            .write(CacheWrite::volume(info))
            .gauge(Gauge::Volumes, 1)
            .into())
    }
}

/// Change the owner and/or the quota of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetVolumePropertyRequest {
    pub volume: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub quota_in_bytes: Option<u64>,
}

impl RequestHandler for SetVolumePropertyRequest {
    fn action(&self) -> OmAction {
        OmAction::SetVolumeProperty
    }

    fn target(&self) -> ResourcePath {
        ResourcePath::volume(&self.volume)
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::Write)
    }

    fn validate(&self) -> OmResult<()> {
        if self.owner.is_none() && self.quota_in_bytes.is_none() {
            return Err(OmError::invalid_request(
                "set volume property needs an owner or a quota",
            ));
        }
        if self.owner.as_deref() == Some("") {
            return Err(OmError::invalid_request("volume owner cannot be empty"));
        }
        Ok(())
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        let mut params = super::path_params(&self.target());
        if let Some(owner) = &self.owner {
            params.insert("owner".to_string(), owner.clone());
        }
        if let Some(quota) = self.quota_in_bytes {
            params.insert("quota_in_bytes".to_string(), quota.to_string());
        }
        params
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        let existing = ctx.volume(&self.volume)?;
        if ctx.is_replay(&existing) {
            return Ok(Plan::Replay);
        }
        let mut info = existing
            .into_value()
            .ok_or_else(|| OmError::VolumeNotFound(self.volume.clone()))?;

        if let Some(quota) = self.quota_in_bytes {
            let used = ctx
                .metadata
                .volume_bytes_used(&self.volume)
                .map_err(store_error)?;
            if quota < used {
                return Err(OmError::QuotaExceeded {
                    volume: self.volume.clone(),
                    quota,
                    required: used,
                });
            }
            info.quota_in_bytes = quota;
        }
        if let Some(owner) = &self.owner {
            info.owner.clone_from(owner);
        }
        info.update_id = ctx.log_index;

        Ok(Mutation::new(ResponseBody::Volume(info.clone()))
            .write(CacheWrite::volume(info))
            .into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume: String,
}

impl RequestHandler for DeleteVolumeRequest {
    fn action(&self) -> OmAction {
        OmAction::DeleteVolume
    }

    fn target(&self) -> ResourcePath {
        ResourcePath::volume(&self.volume)
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::Delete)
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        let existing = ctx.volume(&self.volume)?;
        if ctx.is_replay(&existing) {
            return Ok(Plan::Replay);
        }
        if existing.value().is_none() {
            return Err(OmError::VolumeNotFound(self.volume.clone()));
        }
        if !ctx
            .metadata
            .is_volume_empty(&self.volume)
            .map_err(store_error)?
        {
            return Err(OmError::VolumeNotEmpty(self.volume.clone()));
        }

        Ok(Mutation::new(ResponseBody::Empty)
            .write(CacheWrite::Volume(volume_key(&self.volume), None))
            .gauge(Gauge::Volumes, -1)
            .into())
    }
}
