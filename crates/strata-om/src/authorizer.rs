//! Access check call site
//!
//! Policy evaluation lives behind [`Authorizer`]; the object manager only
//! asks whether a caller may exercise a right on a resource.

use strata_common::{AclRight, ResourcePath, ResourceType, UserInfo};

/// One access question
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub user: &'a UserInfo,
    pub resource: &'a ResourcePath,
    pub right: AclRight,
}

impl AccessRequest<'_> {
    pub fn resource_type(&self) -> ResourceType {
        self.resource.resource_type()
    }
}

pub trait Authorizer: Send + Sync {
    fn name(&self) -> &str;

    fn check_access(&self, request: &AccessRequest<'_>) -> bool;
}

/// Allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn name(&self) -> &str {
        "allow-all"
    }

    fn check_access(&self, _request: &AccessRequest<'_>) -> bool {
        true
    }
}

/// Denies everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllAuthorizer;

impl Authorizer for DenyAllAuthorizer {
    fn name(&self) -> &str {
        "deny-all"
    }

    fn check_access(&self, _request: &AccessRequest<'_>) -> bool {
        false
    }
}
