//! Responses returned to the replication layer

use crate::metrics::OmAction;
use strata_common::{Acl, BucketInfo, KeyInfo, LogIndex, ResultCode, VolumeInfo};
use strata_meta_store::{FlushError, FlushFuture};

/// Typed result of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,
    Volume(VolumeInfo),
    Bucket(BucketInfo),
    Key(KeyInfo),
    /// `changed` is false when the ACL edit was a no-op
    AclChange { changed: bool, acls: Vec<Acl> },
}

/// Outcome of one applied command
#[derive(Debug, Clone)]
pub struct OmResponse {
    pub action: OmAction,
    pub log_index: LogIndex,
    pub status: ResultCode,
    /// Short human-readable note for successful commands
    pub message: Option<String>,
    pub body: ResponseBody,
    /// The command had already been applied; nothing changed
    pub replayed: bool,
    flush: FlushFuture,
}

impl OmResponse {
    pub(crate) fn new(
        action: OmAction,
        log_index: LogIndex,
        status: ResultCode,
        message: Option<String>,
        body: ResponseBody,
        replayed: bool,
        flush: FlushFuture,
    ) -> Self {
        Self {
            action,
            log_index,
            status,
            message,
            body,
            replayed,
            flush,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    /// Completes once the command's effects are durable
    pub fn flush_future(&self) -> FlushFuture {
        self.flush.clone()
    }

    /// Block until the command's effects are durable
    pub fn wait_durable(&self) -> Result<(), FlushError> {
        self.flush.clone().wait()
    }
}
