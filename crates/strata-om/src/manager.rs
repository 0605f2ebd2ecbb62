//! Object manager write path
//!
//! [`OzoneManager::apply`] runs every command through the same steps:
//! count the attempt, validate, check access, lock the target (ancestors
//! shared, target exclusive), let the handler plan the mutation, commit it
//! to the overlay cache, enqueue it for flushing, unlock, then audit.
//! Errors never escape `apply`; they become the response status.
//!
//! Commands may be applied from many threads. Locking and enqueueing
//! follow log order through the [`ApplySequencer`].

use crate::audit::{
    AuditLogger, AuditRecord, FanOutAuditLogger, NullAuditLogger, TracingAuditLogger,
};
use crate::authorizer::{AccessRequest, AllowAllAuthorizer, Authorizer};
use crate::metrics::{Gauge, OmAction, OmMetrics};
use crate::prometheus::{MetricKind, MetricsRecord};
use crate::replay::ReplayDetector;
use crate::request::{
    CacheWrite, OmRequest, Plan, RequestContext, RequestHandler, path_segments, store_error,
};
use crate::response::{OmResponse, ResponseBody};
use crate::sequencer::{ApplySequencer, ApplyTicket};
use std::sync::Arc;
use strata_common::{
    ErrorKind, KEY_SEPARATOR, LogIndex, OmConfig, OmError, OmResult, ResourceType, ResultCode,
    UserInfo,
};
use strata_meta_store::{
    BatchOp, DoubleBuffer, DoubleBufferStats, FlushFuture, FlushTarget, LockGuard, LockMode,
    MetaStoreResult, MetadataManager, PersistentStore,
};
use tracing::{debug, error, info, warn};

/// Flushes through the metadata manager and publishes the durable index
/// to the replay detector
struct DurableSink {
    metadata: Arc<MetadataManager>,
    replay: Arc<ReplayDetector>,
}

impl FlushTarget for DurableSink {
    fn flush_batch(&self, ops: &[BatchOp], last_index: LogIndex) -> MetaStoreResult<()> {
        self.metadata.flush_batch(ops, last_index)?;
        self.replay.advance_durable(last_index);
        Ok(())
    }

    fn evict(&self, op: &BatchOp, log_index: LogIndex) {
        self.metadata.evict(op, log_index);
    }
}

enum Applied {
    Replay,
    Mutated {
        body: ResponseBody,
        message: Option<String>,
    },
}

pub struct OzoneManager {
    config: OmConfig,
    metadata: Arc<MetadataManager>,
    replay: Arc<ReplayDetector>,
    double_buffer: DoubleBuffer,
    sequencer: ApplySequencer,
    metrics: Arc<OmMetrics>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditLogger>,
}

impl OzoneManager {
    /// Open the redb store named by the configuration
    pub fn open(config: OmConfig) -> MetaStoreResult<Self> {
        let path = config.store.resolve_db_path(&config.node);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let metadata = MetadataManager::open(&path)?;
        Self::start(config, metadata)
    }

    pub fn with_store(config: OmConfig, store: Arc<dyn PersistentStore>) -> MetaStoreResult<Self> {
        Self::start(config, MetadataManager::new(store))
    }

    fn start(config: OmConfig, metadata: MetadataManager) -> MetaStoreResult<Self> {
        let metadata = Arc::new(metadata);
        let durable_index = metadata.durable_index()?;
        let replay = Arc::new(ReplayDetector::new(durable_index));

        let sink = Arc::new(DurableSink {
            metadata: Arc::clone(&metadata),
            replay: Arc::clone(&replay),
        });
        let double_buffer = DoubleBuffer::start(sink, &config.double_buffer, durable_index)?;

        let metrics = Arc::new(OmMetrics::new());
        load_gauges(&metadata, &metrics)?;

        let audit: Arc<dyn AuditLogger> = if config.audit.enabled {
            Arc::new(TracingAuditLogger)
        } else {
            Arc::new(NullAuditLogger)
        };

        info!(
            "Object manager {} started at durable index {} ({} volumes, {} buckets, {} keys)",
            config.node.name,
            durable_index,
            metrics.gauge(Gauge::Volumes),
            metrics.gauge(Gauge::Buckets),
            metrics.gauge(Gauge::Keys)
        );

        Ok(Self {
            config,
            metadata,
            replay,
            double_buffer,
            sequencer: ApplySequencer::new(),
            metrics,
            authorizer: Arc::new(AllowAllAuthorizer),
            audit,
        })
    }

    /// Consulted only when `security.acl_enabled` is set
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        info!("Using authorizer {}", authorizer.name());
        self.authorizer = authorizer;
        self
    }

    /// Replace the configured audit sink
    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Send audit records to `audit` as well as to the current sink
    #[must_use]
    pub fn add_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        let current = std::mem::replace(&mut self.audit, Arc::new(NullAuditLogger));
        self.audit = Arc::new(FanOutAuditLogger::new().with(current).with(audit));
        self
    }

    pub fn config(&self) -> &OmConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataManager> {
        &self.metadata
    }

    pub fn metrics(&self) -> &Arc<OmMetrics> {
        &self.metrics
    }

    /// Highest log index known to be in the store
    pub fn durable_index(&self) -> LogIndex {
        self.replay.durable_index()
    }

    pub fn double_buffer_stats(&self) -> DoubleBufferStats {
        self.double_buffer.stats()
    }

    /// Set once a flush has failed; nothing after it will become durable
    pub fn flush_failed_at(&self) -> Option<LogIndex> {
        self.double_buffer.failed_at()
    }

    /// Flush queued transactions without waiting for the batching window
    pub fn flush_now(&self) -> FlushFuture {
        self.double_buffer.flush_now()
    }

    /// Flush what is queued and stop accepting commands for flushing
    pub fn stop(&self) {
        self.double_buffer.stop();
        info!(
            "Object manager {} stopped at durable index {}",
            self.config.node.name,
            self.durable_index()
        );
    }

    /// Apply the command at `log_index`. Calls may overlap, but must be
    /// started in log order.
    pub fn apply(&self, log_index: LogIndex, request: &OmRequest, user: &UserInfo) -> OmResponse {
        let ticket = self.sequencer.admit(log_index);
        let handler = request.handler();
        let action = handler.action();
        self.metrics.inc_attempt(action);

        let mut guards = Vec::with_capacity(ResourceType::ALL.len());
        let mut ops = Vec::new();
        let result = self.execute(handler, &ticket, user, &mut guards, &mut ops);

        // Enqueued before unlocking so a later writer of the same resource
        // lands in the same or a later batch
        let flush = ticket.enqueue(|| {
            if log_index == 0 {
                FlushFuture::completed(Ok(()))
            } else {
                self.double_buffer.add(log_index, ops)
            }
        });
        while let Some(guard) = guards.pop() {
            guard.release();
        }

        match result {
            Ok(Applied::Replay) => {
                debug!(
                    "{} at log index {} was already applied; skipping",
                    action, log_index
                );
                OmResponse::new(
                    action,
                    log_index,
                    ResultCode::Ok,
                    None,
                    ResponseBody::Empty,
                    true,
                    flush,
                )
            }
            Ok(Applied::Mutated { body, message }) => {
                debug!("Applied {} at log index {}", action, log_index);
                self.audit.record(&AuditRecord::success(
                    action,
                    handler.audit_params(),
                    user.clone(),
                    log_index,
                ));
                OmResponse::new(action, log_index, ResultCode::Ok, message, body, false, flush)
            }
            Err(e) => {
                self.metrics.inc_failure(action);
                log_failure(action, log_index, &e);
                let status = e.result_code();
                self.audit.record(&AuditRecord::failure(
                    action,
                    handler.audit_params(),
                    e,
                    user.clone(),
                    log_index,
                ));
                OmResponse::new(
                    action,
                    log_index,
                    status,
                    None,
                    ResponseBody::Empty,
                    false,
                    flush,
                )
            }
        }
    }

    /// Everything between validation and the commit point. Lock guards are
    /// handed back so the caller can enqueue before releasing them.
    fn execute<'m>(
        &'m self,
        handler: &dyn RequestHandler,
        ticket: &ApplyTicket<'_>,
        user: &UserInfo,
        guards: &mut Vec<LockGuard<'m>>,
        ops: &mut Vec<BatchOp>,
    ) -> OmResult<Applied> {
        let log_index = ticket.log_index();
        if log_index == 0 {
            return Err(OmError::invalid_request("log indexes start at 1"));
        }
        handler.validate()?;
        self.check_access(handler, user)?;

        let target = handler.target();
        let segments = path_segments(&target);
        let depth = target.resource_type();
        let exclusive = handler.exclusive_ancestors();
        ticket.wait_to_lock();
        for resource in ResourceType::ALL.into_iter().filter(|r| *r <= depth) {
            let mode = if resource == depth || exclusive.contains(&resource) {
                LockMode::Write
            } else {
                LockMode::Read
            };
            let guard = self
                .metadata
                .locks()
                .acquire(resource, &segments[..=resource.order()], mode)
                .map_err(|e| {
                    error!("Lock acquisition failed for {}: {}", target, e);
                    OmError::internal(e.to_string())
                })?;
            guards.push(guard);
        }
        ticket.locked();

        let ctx = RequestContext {
            metadata: &self.metadata,
            replay: &self.replay,
            log_index,
            user,
        };
        let mutation = match handler.plan(&ctx)? {
            Plan::Replay => return Ok(Applied::Replay),
            Plan::Mutate(mutation) => mutation,
        };
        if let Some(last) = ticket.overtaken_by() {
            return Err(OmError::internal(format!(
                "log index {log_index} arrived after log index {last} was enqueued"
            )));
        }

        // Encoding is the last step that may fail; nothing below does
        let encoded = mutation
            .writes
            .iter()
            .map(CacheWrite::to_batch_op)
            .collect::<MetaStoreResult<Vec<_>>>()
            .map_err(store_error)?;

        for write in mutation.writes {
            let key = write.table_key().to_string();
            if !write.install(&self.metadata, log_index) {
                abort_diverged(&key, log_index);
            }
        }
        for (gauge, delta) in mutation.gauges {
            self.metrics.adjust(gauge, delta);
        }
        *ops = encoded;

        Ok(Applied::Mutated {
            body: mutation.body,
            message: mutation.message,
        })
    }

    fn check_access(&self, handler: &dyn RequestHandler, user: &UserInfo) -> OmResult<()> {
        if !self.config.security.acl_enabled {
            return Ok(());
        }
        let (resource, right) = handler.required_access();
        let request = AccessRequest {
            user,
            resource: &resource,
            right,
        };
        if self.authorizer.check_access(&request) {
            return Ok(());
        }
        Err(OmError::PermissionDenied {
            user: user.user_name.clone(),
            action: right.to_string(),
            resource: resource.to_string(),
        })
    }

    /// Metrics records for export, tagged with this node
    pub fn metrics_records(&self) -> Vec<MetricsRecord> {
        let tags = [("Context", "om"), ("Hostname", self.config.node.name.as_str())];
        let stats = self.double_buffer.stats();

        let mut buffer = MetricsRecord::new("OMDoubleBufferMetrics");
        for (name, value) in tags {
            buffer = buffer.tag(name, value);
        }
        buffer = buffer
            .metric(
                "TotalNumOfFlushOperations",
                MetricKind::Counter,
                stats.flush_iterations as f64,
            )
            .metric(
                "TotalNumOfFlushedTransactions",
                MetricKind::Counter,
                stats.flushed_transactions as f64,
            )
            .metric(
                "MaxNumberOfTransactionsFlushedInOneIteration",
                MetricKind::Gauge,
                stats.max_batch_size as f64,
            )
            .metric("DurableIndex", MetricKind::Gauge, stats.durable_index as f64)
            .metric("PendingTransactions", MetricKind::Gauge, stats.pending as f64);

        vec![self.metrics.snapshot(&tags), buffer]
    }
}

/// Seed the entity gauges from what the store already holds
fn load_gauges(metadata: &MetadataManager, metrics: &OmMetrics) -> MetaStoreResult<()> {
    let root = KEY_SEPARATOR.to_string();
    let count = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
    metrics.set_gauge(Gauge::Volumes, count(metadata.volumes().scan_prefix(&root)?.len()));
    metrics.set_gauge(Gauge::Buckets, count(metadata.buckets().scan_prefix(&root)?.len()));
    metrics.set_gauge(Gauge::Keys, count(metadata.keys().scan_prefix(&root)?.len()));
    Ok(())
}

fn log_failure(action: OmAction, log_index: LogIndex, e: &OmError) {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::Precondition => {
            debug!("{} at log index {} failed: {}", action, log_index, e);
        }
        ErrorKind::Authorization => warn!("{} at log index {} denied: {}", action, log_index, e),
        ErrorKind::Internal => error!("{} at log index {} failed: {}", action, log_index, e),
    }
}

/// The overlay already holds a newer version than the command being
/// applied; replicas can no longer agree
fn abort_diverged(key: &str, log_index: LogIndex) -> ! {
    error!(
        "Cache entry for {} is newer than log index {}; aborting",
        key, log_index
    );
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditOutcome, RecordingAuditLogger};
    use crate::authorizer::DenyAllAuthorizer;
    use crate::prometheus::PrometheusSink;
    use crate::request::{
        AddAclRequest, CommitKeyRequest, CreateBucketRequest, CreateVolumeRequest,
        DeleteBucketRequest, DeleteKeyRequest, DeleteVolumeRequest, RemoveAclRequest,
        SetAclRequest, SetBucketPropertyRequest, SetVolumePropertyRequest,
    };
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};
    use strata_common::{Acl, ResourcePath, bucket_key};
    use strata_meta_store::{FlushError, MemoryStore, TableName};
    use tempfile::TempDir;

    fn test_config() -> OmConfig {
        let mut config = OmConfig::default();
        config.node.name = "om1".to_string();
        config.double_buffer.flush_interval_ms = 1;
        config
    }

    fn manager() -> (OzoneManager, Arc<MemoryStore>, Arc<RecordingAuditLogger>) {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(RecordingAuditLogger::default());
        let om = OzoneManager::with_store(test_config(), store.clone())
            .unwrap()
            .add_audit_logger(audit.clone());
        (om, store, audit)
    }

    fn alice() -> UserInfo {
        UserInfo::new("alice").with_remote_address("10.0.0.7")
    }

    /// vol1 owned by alice at index 1, vol1/bucket1 at index 2
    fn seed(om: &OzoneManager) {
        let volume = om.apply(
            1,
            &OmRequest::CreateVolume(CreateVolumeRequest::new("vol1", "alice")),
            &alice(),
        );
        assert_eq!(volume.status, ResultCode::Ok);
        let bucket = om.apply(
            2,
            &OmRequest::CreateBucket(CreateBucketRequest::new("vol1", "bucket1")),
            &alice(),
        );
        assert_eq!(bucket.status, ResultCode::Ok);
    }

    fn delete_bucket(bucket: &str) -> OmRequest {
        OmRequest::DeleteBucket(DeleteBucketRequest::new("vol1", bucket))
    }

    fn create_bucket(volume: &str, bucket: &str) -> OmRequest {
        OmRequest::CreateBucket(CreateBucketRequest::new(volume, bucket))
    }

    fn commit_key(bucket: &str, key: &str, size: u64) -> OmRequest {
        OmRequest::CommitKey(CommitKeyRequest::new("vol1", bucket, key, size))
    }

    fn set_volume(owner: Option<&str>, quota_in_bytes: Option<u64>) -> OmRequest {
        OmRequest::SetVolumeProperty(SetVolumePropertyRequest {
            volume: "vol1".to_string(),
            owner: owner.map(str::to_string),
            quota_in_bytes,
        })
    }

    fn delete_volume(volume: &str) -> OmRequest {
        OmRequest::DeleteVolume(DeleteVolumeRequest {
            volume: volume.to_string(),
        })
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_delete_empty_bucket() {
        let (om, store, audit) = manager();
        seed(&om);
        assert_eq!(om.metrics().gauge(Gauge::Buckets), 1);
        store.set_write_delay(Duration::from_millis(200));

        let response = om.apply(10, &delete_bucket("bucket1"), &alice());
        assert_eq!(response.status, ResultCode::Ok);
        assert!(!response.replayed);

        // Tombstone sits in the overlay until its batch is durable
        let cached = om
            .metadata()
            .buckets()
            .cache()
            .get(&bucket_key("vol1", "bucket1"))
            .unwrap();
        assert!(cached.is_tombstone());
        assert_eq!(cached.log_index, 10);
        assert!(!om.metadata().buckets().exists(&bucket_key("vol1", "bucket1")).unwrap());
        assert_eq!(om.metrics().gauge(Gauge::Buckets), 0);

        let records = audit.records();
        assert_eq!(records.len(), 3);
        let last = records.last().unwrap();
        assert_eq!(last.action, OmAction::DeleteBucket);
        assert_eq!(last.outcome, AuditOutcome::Success);
        assert_eq!(last.log_index, 10);
        assert_eq!(last.params.get("bucket").map(String::as_str), Some("bucket1"));

        response.wait_durable().unwrap();
        assert_eq!(om.durable_index(), 10);
        assert_eq!(store.len(TableName::Buckets), 0);
        assert!(om.metadata().buckets().cache().is_empty());
    }

    #[test]
    fn test_delete_non_empty_bucket() {
        let (om, _store, audit) = manager();
        seed(&om);
        let commit = om.apply(
            3,
            &OmRequest::CommitKey(CommitKeyRequest::new("vol1", "bucket1", "dir/k1", 10)),
            &alice(),
        );
        assert_eq!(commit.status, ResultCode::Ok);

        let response = om.apply(4, &delete_bucket("bucket1"), &alice());
        assert_eq!(response.status, ResultCode::BucketNotEmpty);
        assert!(om.metadata().buckets().exists(&bucket_key("vol1", "bucket1")).unwrap());
        assert_eq!(om.metrics().gauge(Gauge::Buckets), 1);
        assert_eq!(om.metrics().failures(OmAction::DeleteBucket), 1);

        let last = audit.records().pop().unwrap();
        assert_eq!(last.outcome, AuditOutcome::Failure);
        assert!(matches!(last.error, Some(OmError::BucketNotEmpty { .. })));

        // An errored command still occupies its slot in the flush order
        response.wait_durable().unwrap();
        assert_eq!(om.durable_index(), 4);
    }

    #[test]
    fn test_delete_missing_bucket() {
        let (om, _store, _audit) = manager();
        seed(&om);
        let response = om.apply(3, &delete_bucket("nope"), &alice());
        assert_eq!(response.status, ResultCode::BucketNotFound);
        assert_eq!(om.metrics().attempts(OmAction::DeleteBucket), 1);
        assert_eq!(om.metrics().failures(OmAction::DeleteBucket), 1);
    }

    #[test]
    fn test_replayed_delete_is_a_no_op() {
        let (om, _store, audit) = manager();
        seed(&om);
        assert_eq!(om.apply(10, &delete_bucket("bucket1"), &alice()).status, ResultCode::Ok);
        let audited = audit.records().len();

        let replay = om.apply(10, &delete_bucket("bucket1"), &alice());
        assert_eq!(replay.status, ResultCode::Ok);
        assert!(replay.replayed);
        assert_eq!(om.metrics().gauge(Gauge::Buckets), 0);
        assert_eq!(om.metrics().attempts(OmAction::DeleteBucket), 2);
        assert_eq!(om.metrics().failures(OmAction::DeleteBucket), 0);
        assert_eq!(audit.records().len(), audited);
    }

    #[test]
    fn test_replay_of_durable_index() {
        let (om, _store, _audit) = manager();
        seed(&om);
        om.apply(10, &delete_bucket("bucket1"), &alice())
            .wait_durable()
            .unwrap();
        assert!(om.metadata().buckets().cache().is_empty());

        // Nothing left to compare against except the durable index
        let replay = om.apply(
            2,
            &OmRequest::CreateBucket(CreateBucketRequest::new("vol1", "bucket1")),
            &alice(),
        );
        assert!(replay.replayed);
        assert!(!om.metadata().buckets().exists(&bucket_key("vol1", "bucket1")).unwrap());
    }

    #[test]
    fn test_acl_commands() {
        let (om, _store, _audit) = manager();
        seed(&om);
        let bucket = ResourcePath::bucket("vol1", "bucket1");
        let add = OmRequest::AddAcl(AddAclRequest {
            resource: bucket.clone(),
            acl: "user:bob:r".to_string(),
        });
        let remove = OmRequest::RemoveAcl(RemoveAclRequest {
            resource: bucket.clone(),
            acl: "user:bob:r".to_string(),
        });

        let added = om.apply(3, &add, &alice());
        assert_eq!(added.message.as_deref(), Some("Acl added successfully."));
        let ResponseBody::AclChange { changed, acls } = &added.body else {
            panic!("unexpected body {:?}", added.body);
        };
        assert!(changed);
        // Inherited from the volume owner plus the new entry
        assert_eq!(acls, &Acl::parse_list("user:alice:a,user:bob:r").unwrap());

        let again = om.apply(4, &add, &alice());
        assert_eq!(again.status, ResultCode::Ok);
        assert_eq!(again.message.as_deref(), Some("Acl already exists."));

        let removed = om.apply(5, &remove, &alice());
        assert_eq!(removed.message.as_deref(), Some("Acl removed successfully."));
        let missing = om.apply(6, &remove, &alice());
        assert_eq!(missing.message.as_deref(), Some("Acl doesn't exist."));

        let set = om.apply(
            7,
            &OmRequest::SetAcl(SetAclRequest {
                resource: bucket,
                acls: vec!["group:ops:l".to_string()],
            }),
            &alice(),
        );
        assert_eq!(set.message.as_deref(), Some("Acl set successfully."));
        let stored = om
            .metadata()
            .buckets()
            .get(&bucket_key("vol1", "bucket1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.acls, Acl::parse_list("group:ops:l").unwrap());
        assert_eq!(stored.update_id, 7);

        let on_missing_key = om.apply(
            8,
            &OmRequest::AddAcl(AddAclRequest {
                resource: ResourcePath::key("vol1", "bucket1", "nope"),
                acl: "user:bob:r".to_string(),
            }),
            &alice(),
        );
        assert_eq!(on_missing_key.status, ResultCode::KeyNotFound);
    }

    #[test]
    fn test_volume_quota() {
        let (om, _store, _audit) = manager();
        let mut create = CreateVolumeRequest::new("vol1", "alice");
        create.quota_in_bytes = 1000;
        om.apply(1, &OmRequest::CreateVolume(create), &alice());
        om.apply(
            2,
            &OmRequest::CreateBucket(CreateBucketRequest::new("vol1", "bucket1")),
            &alice(),
        );

        let commit = |index, key: &str, size| {
            om.apply(
                index,
                &OmRequest::CommitKey(CommitKeyRequest::new("vol1", "bucket1", key, size)),
                &alice(),
            )
        };
        assert_eq!(commit(3, "k1", 300).status, ResultCode::Ok);
        assert_eq!(commit(4, "k2", 100).status, ResultCode::QuotaExceeded);
        // Overwriting releases the old size first
        assert_eq!(commit(5, "k1", 333).status, ResultCode::Ok);
        assert_eq!(om.metrics().gauge(Gauge::Keys), 1);
    }

    #[test]
    fn test_permission_denied_before_locking() {
        let store = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.security.acl_enabled = true;
        let audit = Arc::new(RecordingAuditLogger::default());
        let om = OzoneManager::with_store(config, store)
            .unwrap()
            .with_authorizer(Arc::new(DenyAllAuthorizer))
            .with_audit_logger(audit.clone());

        let response = om.apply(
            1,
            &OmRequest::CreateVolume(CreateVolumeRequest::new("vol1", "alice")),
            &alice(),
        );
        assert_eq!(response.status, ResultCode::PermissionDenied);
        assert_eq!(om.metadata().locks().active_locks(), 0);
        assert!(om.metadata().volumes().cache().is_empty());
        assert_eq!(audit.records()[0].outcome, AuditOutcome::Failure);
    }

    #[test]
    fn test_invalid_requests() {
        let (om, _store, _audit) = manager();
        let response = om.apply(
            0,
            &OmRequest::CreateVolume(CreateVolumeRequest::new("vol1", "alice")),
            &alice(),
        );
        assert_eq!(response.status, ResultCode::InvalidRequest);

        let response = om.apply(
            1,
            &OmRequest::CreateVolume(CreateVolumeRequest::new("Vol_1", "alice")),
            &alice(),
        );
        assert_eq!(response.status, ResultCode::InvalidVolumeName);
        assert_eq!(om.metrics().failures(OmAction::CreateVolume), 2);
    }

    #[test]
    fn test_writers_of_one_bucket_are_serialized() {
        let (om, _store, _audit) = manager();
        seed(&om);
        let om = Arc::new(om);

        let held = om
            .metadata()
            .locks()
            .acquire(ResourceType::Bucket, &["vol1", "bucket1"], LockMode::Write)
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&om);
        let handle = thread::spawn(move || {
            let response = worker.apply(3, &delete_bucket("bucket1"), &alice());
            tx.send(response.status).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ResultCode::Ok
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_slow_store_does_not_block_apply() {
        let (om, store, _audit) = manager();
        store.set_write_delay(Duration::from_millis(300));

        let started = Instant::now();
        let response = om.apply(
            1,
            &OmRequest::CreateVolume(CreateVolumeRequest::new("vol1", "alice")),
            &alice(),
        );
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!response.flush_future().is_complete());
        // Visible through the overlay before it is durable
        assert!(om.metadata().volumes().exists("/vol1").unwrap());

        response.wait_durable().unwrap();
        assert_eq!(store.len(TableName::Volumes), 1);
    }

    #[test]
    fn test_flush_failure_reaches_callers() {
        let (om, store, _audit) = manager();
        store.set_fail_writes(true);

        let first = om.apply(
            1,
            &OmRequest::CreateVolume(CreateVolumeRequest::new("vol1", "alice")),
            &alice(),
        );
        assert_eq!(first.status, ResultCode::Ok);
        assert!(matches!(
            first.wait_durable(),
            Err(FlushError::WriteFailed { last_index: 1, .. })
        ));

        let second = om.apply(
            2,
            &OmRequest::CreateBucket(CreateBucketRequest::new("vol1", "bucket1")),
            &alice(),
        );
        assert_eq!(
            second.wait_durable(),
            Err(FlushError::Halted { failed_at: 1 })
        );
        assert_eq!(om.flush_failed_at(), Some(1));
    }

    #[test]
    fn test_metrics_export() {
        let (om, _store, _audit) = manager();
        seed(&om);
        om.apply(3, &delete_bucket("bucket1"), &alice())
            .wait_durable()
            .unwrap();

        let sink = PrometheusSink::new(&om.config().metrics.excluded_tags);
        for record in om.metrics_records() {
            sink.put_metrics(&record);
        }
        let output = sink.export();
        assert!(output.contains("# TYPE om_metrics_num_bucket_deletes counter\n"));
        assert!(output.contains("om_metrics_num_bucket_deletes{context=\"om\",hostname=\"om1\"} 1\n"));
        assert!(output.contains("om_metrics_num_buckets{context=\"om\",hostname=\"om1\"} 0\n"));
        assert!(output.contains("om_double_buffer_metrics_durable_index{context=\"om\",hostname=\"om1\"} 3\n"));
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.node.data_dir = dir.path().to_path_buf();

        {
            let om = OzoneManager::open(config.clone()).unwrap();
            seed(&om);
            om.flush_now().wait().unwrap();
            om.stop();
        }

        let om = OzoneManager::open(config).unwrap();
        assert_eq!(om.durable_index(), 2);
        assert_eq!(om.metrics().gauge(Gauge::Volumes), 1);
        assert_eq!(om.metrics().gauge(Gauge::Buckets), 1);

        let replay = om.apply(
            2,
            &OmRequest::CreateBucket(CreateBucketRequest::new("vol1", "bucket1")),
            &alice(),
        );
        assert!(replay.replayed);
        let next = om.apply(
            3,
            &OmRequest::CreateBucket(CreateBucketRequest::new("vol1", "bucket2")),
            &alice(),
        );
        assert_eq!(next.status, ResultCode::Ok);
    }

    #[test]
    fn test_volume_commands() {
        let (om, _store, _audit) = manager();
        let create = OmRequest::CreateVolume(CreateVolumeRequest::new("vol1", "alice"));
        assert_eq!(om.apply(1, &create, &alice()).status, ResultCode::Ok);
        assert_eq!(
            om.apply(2, &create, &alice()).status,
            ResultCode::VolumeAlreadyExists
        );

        let owner = om.apply(3, &set_volume(Some("bob"), None), &alice());
        assert_eq!(owner.status, ResultCode::Ok);
        let ResponseBody::Volume(info) = &owner.body else {
            panic!("unexpected body {:?}", owner.body);
        };
        assert_eq!(info.owner, "bob");
        assert_eq!(info.update_id, 3);
        assert_eq!(
            om.apply(4, &set_volume(None, None), &alice()).status,
            ResultCode::InvalidRequest
        );

        assert_eq!(
            om.apply(5, &create_bucket("vol1", "bucket1"), &alice()).status,
            ResultCode::Ok
        );
        // 100 bytes at replication 3
        assert_eq!(
            om.apply(6, &commit_key("bucket1", "k1", 100), &alice()).status,
            ResultCode::Ok
        );
        assert_eq!(
            om.apply(7, &set_volume(None, Some(200)), &alice()).status,
            ResultCode::QuotaExceeded
        );
        assert_eq!(
            om.apply(8, &set_volume(None, Some(300)), &alice()).status,
            ResultCode::Ok
        );
        let volume = om.metadata().volumes().get("/vol1").unwrap().unwrap();
        assert_eq!(volume.quota_in_bytes, 300);
        assert_eq!(volume.owner, "bob");

        assert_eq!(
            om.apply(9, &delete_volume("vol1"), &alice()).status,
            ResultCode::VolumeNotEmpty
        );
        let delete_key = OmRequest::DeleteKey(DeleteKeyRequest::new("vol1", "bucket1", "k1"));
        assert_eq!(om.apply(10, &delete_key, &alice()).status, ResultCode::Ok);
        assert_eq!(om.apply(11, &delete_bucket("bucket1"), &alice()).status, ResultCode::Ok);
        assert_eq!(om.apply(12, &delete_volume("vol1"), &alice()).status, ResultCode::Ok);
        assert_eq!(om.metrics().gauge(Gauge::Volumes), 0);
        assert!(!om.metadata().volumes().exists("/vol1").unwrap());

        assert_eq!(
            om.apply(13, &delete_volume("vol1"), &alice()).status,
            ResultCode::VolumeNotFound
        );
        assert_eq!(
            om.apply(14, &set_volume(Some("carol"), None), &alice()).status,
            ResultCode::VolumeNotFound
        );
        assert_eq!(om.metrics().failures(OmAction::DeleteVolume), 2);
        assert_eq!(om.metrics().failures(OmAction::SetVolumeProperty), 3);
    }

    #[test]
    fn test_bucket_commands() {
        let (om, _store, _audit) = manager();
        seed(&om);
        assert_eq!(
            om.apply(3, &create_bucket("vol1", "bucket1"), &alice()).status,
            ResultCode::BucketAlreadyExists
        );
        assert_eq!(
            om.apply(4, &create_bucket("vol9", "bucket1"), &alice()).status,
            ResultCode::VolumeNotFound
        );
        assert_eq!(
            om.apply(5, &create_bucket("vol1", "b1"), &alice()).status,
            ResultCode::InvalidBucketName
        );

        let set = |bucket: &str, versioning: Option<bool>| {
            OmRequest::SetBucketProperty(SetBucketPropertyRequest {
                volume: "vol1".to_string(),
                bucket: bucket.to_string(),
                versioning,
                storage_type: None,
            })
        };
        let response = om.apply(6, &set("bucket1", Some(true)), &alice());
        assert_eq!(response.status, ResultCode::Ok);
        let stored = om
            .metadata()
            .buckets()
            .get(&bucket_key("vol1", "bucket1"))
            .unwrap()
            .unwrap();
        assert!(stored.versioning);
        assert_eq!(stored.update_id, 6);
        // Unchanged by a property update
        assert_eq!(stored.acls, Acl::parse_list("user:alice:a").unwrap());

        assert_eq!(
            om.apply(7, &set("bucket9", Some(true)), &alice()).status,
            ResultCode::BucketNotFound
        );
        assert_eq!(
            om.apply(8, &set("bucket1", None), &alice()).status,
            ResultCode::InvalidRequest
        );
        assert_eq!(om.metrics().gauge(Gauge::Buckets), 1);
    }

    #[test]
    fn test_key_commands() {
        let (om, store, audit) = manager();
        seed(&om);
        store.set_write_delay(Duration::from_millis(200));
        let committed = om.apply(3, &commit_key("bucket1", "dir/k1", 10), &alice());
        assert_eq!(committed.status, ResultCode::Ok);
        let ResponseBody::Key(info) = &committed.body else {
            panic!("unexpected body {:?}", committed.body);
        };
        assert_eq!(info.replication_factor, 3);
        assert_eq!(om.metrics().gauge(Gauge::Keys), 1);

        let delete = |bucket: &str| {
            OmRequest::DeleteKey(DeleteKeyRequest::new("vol1", bucket, "dir/k1"))
        };
        assert_eq!(om.apply(4, &delete("bucket1"), &alice()).status, ResultCode::Ok);
        assert_eq!(om.metrics().gauge(Gauge::Keys), 0);
        let cached = om
            .metadata()
            .keys()
            .cache()
            .get(&strata_common::object_key("vol1", "bucket1", "dir/k1"))
            .unwrap();
        assert!(cached.is_tombstone());

        assert_eq!(
            om.apply(5, &delete("bucket1"), &alice()).status,
            ResultCode::KeyNotFound
        );
        assert_eq!(
            om.apply(6, &delete("bucket9"), &alice()).status,
            ResultCode::BucketNotFound
        );
        assert_eq!(
            om.apply(7, &commit_key("bucket9", "k1", 1), &alice()).status,
            ResultCode::BucketNotFound
        );
        assert_eq!(om.metrics().gauge(Gauge::Keys), 0);
        assert_eq!(om.metrics().failures(OmAction::DeleteKey), 2);

        let last = audit.records().pop().unwrap();
        assert_eq!(last.action, OmAction::CommitKey);
        assert_eq!(last.outcome, AuditOutcome::Failure);
    }

    #[test]
    fn test_lower_index_waiting_on_a_lock_is_applied() {
        let (om, _store, _audit) = manager();
        seed(&om);
        let vol2 = OmRequest::CreateVolume(CreateVolumeRequest::new("vol2", "alice"));
        assert_eq!(om.apply(3, &vol2, &alice()).status, ResultCode::Ok);
        let om = Arc::new(om);

        let held = om
            .metadata()
            .locks()
            .acquire(ResourceType::Bucket, &["vol1", "bucket2"], LockMode::Write)
            .unwrap();

        let (low_tx, low_rx) = mpsc::channel();
        let worker = Arc::clone(&om);
        let low = thread::spawn(move || {
            let response = worker.apply(4, &create_bucket("vol1", "bucket2"), &alice());
            low_tx.send(response).unwrap();
        });
        wait_until(|| om.metrics().attempts(OmAction::CreateBucket) == 2);

        // Unrelated entity, but it may not overtake index 4
        let (high_tx, high_rx) = mpsc::channel();
        let worker = Arc::clone(&om);
        let high = thread::spawn(move || {
            let response = worker.apply(5, &create_bucket("vol2", "bucket9"), &alice());
            high_tx.send(response).unwrap();
        });
        assert!(high_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(om.durable_index() <= 3);

        drop(held);
        let low_response = low_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let high_response = high_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        low.join().unwrap();
        high.join().unwrap();

        assert_eq!(low_response.status, ResultCode::Ok);
        assert!(!low_response.replayed);
        assert_eq!(high_response.status, ResultCode::Ok);
        low_response.wait_durable().unwrap();
        high_response.wait_durable().unwrap();
        assert_eq!(om.durable_index(), 5);
        assert!(om.metadata().buckets().exists(&bucket_key("vol1", "bucket2")).unwrap());
        assert!(om.metadata().buckets().exists(&bucket_key("vol2", "bucket9")).unwrap());
    }

    #[test]
    fn test_command_started_out_of_order_is_rejected() {
        let (om, store, _audit) = manager();
        seed(&om);
        // Keep the durable index below both commands
        store.set_write_delay(Duration::from_millis(500));
        assert_eq!(
            om.apply(9, &create_bucket("vol1", "bucket9"), &alice()).status,
            ResultCode::Ok
        );

        let late = om.apply(4, &create_bucket("vol1", "bucket4"), &alice());
        assert_eq!(late.status, ResultCode::InternalError);
        assert!(!om.metadata().buckets().exists(&bucket_key("vol1", "bucket4")).unwrap());
        assert_eq!(late.wait_durable(), Ok(()));
        assert_eq!(om.durable_index(), 9);
    }

    #[test]
    fn test_commits_in_one_volume_check_quota_in_turn() {
        let (om, _store, _audit) = manager();
        let mut create = CreateVolumeRequest::new("vol1", "alice");
        create.quota_in_bytes = 1000;
        om.apply(1, &OmRequest::CreateVolume(create), &alice());
        om.apply(2, &create_bucket("vol1", "bucket1"), &alice());
        om.apply(3, &create_bucket("vol1", "bucket2"), &alice());
        let om = Arc::new(om);

        // Commits need the volume exclusively, so a shared holder stalls them
        let held = om
            .metadata()
            .locks()
            .acquire(ResourceType::Volume, &["vol1"], LockMode::Read)
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for (index, bucket) in [(4, "bucket1"), (5, "bucket2")] {
            let worker = Arc::clone(&om);
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let response = worker.apply(index, &commit_key(bucket, "k1", 200), &alice());
                tx.send((index, response.status)).unwrap();
            }));
            wait_until(|| om.metrics().attempts(OmAction::CommitKey) == index - 3);
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(held);
        let mut statuses: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        statuses.sort_unstable_by_key(|(index, _)| *index);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            statuses,
            vec![(4, ResultCode::Ok), (5, ResultCode::QuotaExceeded)]
        );
        assert_eq!(om.metadata().volume_bytes_used("vol1").unwrap(), 600);
    }

    #[tokio::test]
    async fn test_flush_future_is_awaitable() {
        let (om, _store, _audit) = manager();
        let response = om.apply(
            1,
            &OmRequest::CreateVolume(CreateVolumeRequest::new("vol1", "alice")),
            &alice(),
        );
        response.flush_future().await.unwrap();
        assert_eq!(om.double_buffer_stats().durable_index, 1);
    }
}
