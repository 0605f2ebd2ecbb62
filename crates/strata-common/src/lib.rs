//! Strata Common - Shared types and utilities
//!
//! This crate provides the entity model (volumes, buckets, keys), the
//! error taxonomy surfaced to clients, ACLs and configuration used by the
//! object manager write path.

pub mod acl;
pub mod config;
pub mod error;
pub mod types;

pub use acl::{Acl, AclIdentityType, AclRight, AclRights};
pub use config::OmConfig;
pub use error::{ErrorKind, OmError, OmResult, ResultCode};
pub use types::*;
