//! ACL commands on volumes, buckets and keys
//!
//! All three edit the ACL list of whatever entity the resource path names.
//! An edit that leaves the list unchanged succeeds without writing.

use super::{CacheWrite, Mutation, Plan, RequestContext, RequestHandler, parse_acls};
use crate::metrics::OmAction;
use crate::response::ResponseBody;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_common::{Acl, AclRight, Entity, OmError, OmResult, ResourcePath, ResourceType};
use strata_meta_store::Lookup;

enum AclEdit {
    Add(Acl),
    Remove(Acl),
    Set(Vec<Acl>),
}

impl AclEdit {
    /// Apply to `acls`; returns whether anything changed and the response message
    fn apply(self, acls: &mut Vec<Acl>) -> (bool, &'static str) {
        match self {
            Self::Add(acl) => {
                if Acl::add_to(acls, &acl) {
                    (true, "Acl added successfully.")
                } else {
                    (false, "Acl already exists.")
                }
            }
            Self::Remove(acl) => {
                if Acl::remove_from(acls, &acl) {
                    (true, "Acl removed successfully.")
                } else {
                    (false, "Acl doesn't exist.")
                }
            }
            Self::Set(new) => {
                let changed = *acls != new;
                *acls = new;
                (changed, "Acl set successfully.")
            }
        }
    }
}

fn check_resource(resource: &ResourcePath) -> OmResult<()> {
    if resource.key.is_some() && resource.bucket.is_none() {
        return Err(OmError::invalid_request(format!(
            "resource {resource} names a key without a bucket"
        )));
    }
    Ok(())
}

fn parse_one(acl: &str) -> OmResult<Acl> {
    acl.parse::<Acl>()
        .map_err(|e| OmError::invalid_request(e.to_string()))
}

fn plan_edit(ctx: &RequestContext<'_>, resource: &ResourcePath, edit: AclEdit) -> OmResult<Plan> {
    let volume = resource.volume.as_str();
    let bucket = resource.bucket.as_deref().unwrap_or_default();
    let key = resource.key.as_deref().unwrap_or_default();
    match resource.resource_type() {
        ResourceType::Volume => edit_entity(
            ctx,
            ctx.volume(volume)?,
            edit,
            || OmError::VolumeNotFound(volume.to_string()),
            CacheWrite::volume,
        ),
        ResourceType::Bucket => edit_entity(
            ctx,
            ctx.bucket(volume, bucket)?,
            edit,
            || OmError::bucket_not_found(volume, bucket),
            CacheWrite::bucket,
        ),
        ResourceType::Key => edit_entity(
            ctx,
            ctx.key(volume, bucket, key)?,
            edit,
            || OmError::key_not_found(volume, bucket, key),
            CacheWrite::key,
        ),
    }
}

fn edit_entity<V: Entity>(
    ctx: &RequestContext<'_>,
    lookup: Lookup<V>,
    edit: AclEdit,
    not_found: impl FnOnce() -> OmError,
    write: impl FnOnce(V) -> CacheWrite,
) -> OmResult<Plan> {
    if ctx.is_replay(&lookup) {
        return Ok(Plan::Replay);
    }
    let mut entity = lookup.into_value().ok_or_else(not_found)?;

    let (changed, message) = edit.apply(entity.acls_mut());
    let body = ResponseBody::AclChange {
        changed,
        acls: entity.acls().to_vec(),
    };
    let mutation = Mutation::new(body).message(message);
    if !changed {
        return Ok(mutation.into());
    }
    entity.set_update_id(ctx.log_index);
    Ok(mutation.write(write(entity)).into())
}

fn acl_params(resource: &ResourcePath, acls: &str) -> BTreeMap<String, String> {
    let mut params = super::path_params(resource);
    params.insert("acls".to_string(), acls.to_string());
    params
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAclRequest {
    pub resource: ResourcePath,
    /// `type:name:rights`
    pub acl: String,
}

impl RequestHandler for AddAclRequest {
    fn action(&self) -> OmAction {
        OmAction::AddAcl
    }

    fn target(&self) -> ResourcePath {
        self.resource.clone()
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::WriteAcl)
    }

    fn validate(&self) -> OmResult<()> {
        check_resource(&self.resource)?;
        parse_one(&self.acl).map(|_| ())
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        acl_params(&self.resource, &self.acl)
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        plan_edit(ctx, &self.resource, AclEdit::Add(parse_one(&self.acl)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveAclRequest {
    pub resource: ResourcePath,
    /// `type:name:rights`; only the listed rights are removed
    pub acl: String,
}

impl RequestHandler for RemoveAclRequest {
    fn action(&self) -> OmAction {
        OmAction::RemoveAcl
    }

    fn target(&self) -> ResourcePath {
        self.resource.clone()
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::WriteAcl)
    }

    fn validate(&self) -> OmResult<()> {
        check_resource(&self.resource)?;
        parse_one(&self.acl).map(|_| ())
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        acl_params(&self.resource, &self.acl)
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        plan_edit(ctx, &self.resource, AclEdit::Remove(parse_one(&self.acl)?))
    }
}

/// Replace the whole ACL list of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAclRequest {
    pub resource: ResourcePath,
    pub acls: Vec<String>,
}

impl RequestHandler for SetAclRequest {
    fn action(&self) -> OmAction {
        OmAction::SetAcl
    }

    fn target(&self) -> ResourcePath {
        self.resource.clone()
    }

    fn required_access(&self) -> (ResourcePath, AclRight) {
        (self.target(), AclRight::WriteAcl)
    }

    fn validate(&self) -> OmResult<()> {
        check_resource(&self.resource)?;
        parse_acls(&self.acls).map(|_| ())
    }

    fn audit_params(&self) -> BTreeMap<String, String> {
        acl_params(&self.resource, &self.acls.join(","))
    }

    fn plan(&self, ctx: &RequestContext<'_>) -> OmResult<Plan> {
        plan_edit(ctx, &self.resource, AclEdit::Set(parse_acls(&self.acls)?))
    }
}
