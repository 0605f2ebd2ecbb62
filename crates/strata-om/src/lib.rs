//! Strata OM - write-path state machine of the object manager
//!
//! Applies commands delivered by the replicated log, in log order:
//!
//! ```text
//! RECEIVED → ACL_CHECKED → LOCKED → REPLAY_CHECKED → PRECONDITIONS_VALIDATED
//!   → CACHE_MUTATED → RESPONSE_BUILT → FLUSH_ENQUEUED → UNLOCKED → AUDITED → DONE
//! ```
//!
//! Every command goes through [`OzoneManager::apply`], which returns an
//! [`OmResponse`] carrying the result code and a flush future that
//! completes once the mutation is durable.

pub mod audit;
pub mod authorizer;
pub mod manager;
pub mod metrics;
pub mod prometheus;
pub mod replay;
pub mod request;
pub mod response;
pub mod sequencer;

pub use audit::{
    AuditLogger, AuditOutcome, AuditRecord, FanOutAuditLogger, NullAuditLogger, TracingAuditLogger,
};
pub use authorizer::{AccessRequest, AllowAllAuthorizer, Authorizer, DenyAllAuthorizer};
pub use manager::OzoneManager;
pub use metrics::{Gauge, OmAction, OmMetrics};
pub use prometheus::{MetricKind, MetricsRecord, PrometheusSink};
pub use replay::{ReplayDetector, is_replay};
pub use request::{
    AddAclRequest, CommitKeyRequest, CreateBucketRequest, CreateVolumeRequest, DeleteBucketRequest,
    DeleteKeyRequest, DeleteVolumeRequest, OmRequest, RemoveAclRequest, SetAclRequest,
    SetBucketPropertyRequest, SetVolumePropertyRequest,
};
pub use response::{OmResponse, ResponseBody};
pub use sequencer::{ApplySequencer, ApplyTicket};
