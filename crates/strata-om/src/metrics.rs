//! Object manager counters
//!
//! One attempt and one failure counter per command, plus gauges for the
//! number of live volumes, buckets and keys.

use crate::prometheus::{MetricKind, MetricsRecord};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Mutating commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OmAction {
    CreateVolume,
    SetVolumeProperty,
    DeleteVolume,
    CreateBucket,
    SetBucketProperty,
    DeleteBucket,
    CommitKey,
    DeleteKey,
    AddAcl,
    RemoveAcl,
    SetAcl,
}

impl OmAction {
    pub const ALL: [Self; 11] = [
        Self::CreateVolume,
        Self::SetVolumeProperty,
        Self::DeleteVolume,
        Self::CreateBucket,
        Self::SetBucketProperty,
        Self::DeleteBucket,
        Self::CommitKey,
        Self::DeleteKey,
        Self::AddAcl,
        Self::RemoveAcl,
        Self::SetAcl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateVolume => "CREATE_VOLUME",
            Self::SetVolumeProperty => "SET_VOLUME_PROPERTY",
            Self::DeleteVolume => "DELETE_VOLUME",
            Self::CreateBucket => "CREATE_BUCKET",
            Self::SetBucketProperty => "SET_BUCKET_PROPERTY",
            Self::DeleteBucket => "DELETE_BUCKET",
            Self::CommitKey => "COMMIT_KEY",
            Self::DeleteKey => "DELETE_KEY",
            Self::AddAcl => "ADD_ACL",
            Self::RemoveAcl => "REMOVE_ACL",
            Self::SetAcl => "SET_ACL",
        }
    }

    /// CamelCase stem of the `Num<stem>` / `Num<stem>Fails` counters
    fn metric_stem(self) -> &'static str {
        match self {
            Self::CreateVolume => "VolumeCreates",
            Self::SetVolumeProperty => "VolumeUpdates",
            Self::DeleteVolume => "VolumeDeletes",
            Self::CreateBucket => "BucketCreates",
            Self::SetBucketProperty => "BucketUpdates",
            Self::DeleteBucket => "BucketDeletes",
            Self::CommitKey => "KeyCommits",
            Self::DeleteKey => "KeyDeletes",
            Self::AddAcl => "AddAcl",
            Self::RemoveAcl => "RemoveAcl",
            Self::SetAcl => "SetAcl",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate entity counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gauge {
    Volumes,
    Buckets,
    Keys,
}

impl Gauge {
    fn metric_name(self) -> &'static str {
        match self {
            Self::Volumes => "NumVolumes",
            Self::Buckets => "NumBuckets",
            Self::Keys => "NumKeys",
        }
    }
}

/// Counters owned by one object manager instance
#[derive(Debug, Default)]
pub struct OmMetrics {
    attempts: [AtomicU64; 11],
    failures: [AtomicU64; 11],
    num_volumes: AtomicI64,
    num_buckets: AtomicI64,
    num_keys: AtomicI64,
}

impl OmMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_attempt(&self, action: OmAction) {
        self.attempts[action.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failure(&self, action: OmAction) {
        self.failures[action.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempts(&self, action: OmAction) -> u64 {
        self.attempts[action.index()].load(Ordering::Relaxed)
    }

    pub fn failures(&self, action: OmAction) -> u64 {
        self.failures[action.index()].load(Ordering::Relaxed)
    }

    pub fn adjust(&self, gauge: Gauge, delta: i64) {
        self.gauge_cell(gauge).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, gauge: Gauge, value: i64) {
        self.gauge_cell(gauge).store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, gauge: Gauge) -> i64 {
        self.gauge_cell(gauge).load(Ordering::Relaxed)
    }

    fn gauge_cell(&self, gauge: Gauge) -> &AtomicI64 {
        match gauge {
            Gauge::Volumes => &self.num_volumes,
            Gauge::Buckets => &self.num_buckets,
            Gauge::Keys => &self.num_keys,
        }
    }

    /// Snapshot as a metrics record named `OMMetrics`
    pub fn snapshot(&self, tags: &[(&str, &str)]) -> MetricsRecord {
        let mut record = MetricsRecord::new("OMMetrics");
        for (name, value) in tags {
            record = record.tag(*name, *value);
        }
        for action in OmAction::ALL {
            let stem = action.metric_stem();
            record = record
                .metric(
                    format!("Num{stem}"),
                    MetricKind::Counter,
                    self.attempts(action) as f64,
                )
                .metric(
                    format!("Num{stem}Fails"),
                    MetricKind::Counter,
                    self.failures(action) as f64,
                );
        }
        for gauge in [Gauge::Volumes, Gauge::Buckets, Gauge::Keys] {
            record = record.metric(
                gauge.metric_name(),
                MetricKind::Gauge,
                self.gauge(gauge) as f64,
            );
        }
        record
    }
}
