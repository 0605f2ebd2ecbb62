//! Audit records for applied commands
//!
//! One record per non-replayed command, emitted after all locks are
//! released. Sinks are fire-and-forget and never fail the command.

use crate::metrics::OmAction;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_common::{LogIndex, OmError, UserInfo};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

/// Immutable description of one command's outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub action: OmAction,
    pub params: BTreeMap<String, String>,
    pub outcome: AuditOutcome,
    pub error: Option<OmError>,
    pub user: UserInfo,
    pub log_index: LogIndex,
}

impl AuditRecord {
    pub fn success(
        action: OmAction,
        params: BTreeMap<String, String>,
        user: UserInfo,
        log_index: LogIndex,
    ) -> Self {
        Self {
            action,
            params,
            outcome: AuditOutcome::Success,
            error: None,
            user,
            log_index,
        }
    }

    pub fn failure(
        action: OmAction,
        params: BTreeMap<String, String>,
        error: OmError,
        user: UserInfo,
        log_index: LogIndex,
    ) -> Self {
        Self {
            action,
            params,
            outcome: AuditOutcome::Failure,
            error: Some(error),
            user,
            log_index,
        }
    }

    fn params_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Destination of audit records
pub trait AuditLogger: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Writes records as structured events on the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn record(&self, record: &AuditRecord) {
        let ip = record.user.remote_address.as_deref().unwrap_or("-");
        let params = record.params_string();
        match &record.error {
            None => info!(
                target: "audit",
                action = record.action.as_str(),
                user = %record.user.user_name,
                ip,
                log_index = record.log_index,
                result = record.outcome.as_str(),
                params = %params,
                "command applied"
            ),
            Some(error) => warn!(
                target: "audit",
                action = record.action.as_str(),
                user = %record.user.user_name,
                ip,
                log_index = record.log_index,
                result = record.outcome.as_str(),
                params = %params,
                error = %error,
                "command failed"
            ),
        }
    }
}

/// Drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn record(&self, _record: &AuditRecord) {}
}

/// Forwards each record to every inner logger
#[derive(Default)]
pub struct FanOutAuditLogger {
    loggers: Vec<Arc<dyn AuditLogger>>,
}

impl FanOutAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.loggers.push(logger);
        self
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl AuditLogger for FanOutAuditLogger {
    fn record(&self, record: &AuditRecord) {
        for logger in &self.loggers {
            logger.record(record);
        }
    }
}

/// Keeps records in memory
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingAuditLogger {
    records: parking_lot::Mutex<Vec<AuditRecord>>,
}

#[cfg(test)]
impl RecordingAuditLogger {
    pub(crate) fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[cfg(test)]
impl AuditLogger for RecordingAuditLogger {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("volume".to_string(), "vol1".to_string()),
            ("bucket".to_string(), "b1".to_string()),
        ])
    }

    #[test]
    fn test_record_constructors() {
        let ok = AuditRecord::success(OmAction::DeleteBucket, params(), UserInfo::new("alice"), 10);
        assert_eq!(ok.outcome, AuditOutcome::Success);
        assert!(ok.error.is_none());
        assert_eq!(ok.params_string(), "bucket=b1, volume=vol1");

        let failed = AuditRecord::failure(
            OmAction::DeleteBucket,
            params(),
            OmError::bucket_not_found("vol1", "b1"),
            UserInfo::new("alice").with_remote_address("10.0.0.1"),
            11,
        );
        assert_eq!(failed.outcome, AuditOutcome::Failure);
        assert_eq!(failed.outcome.as_str(), "FAILURE");

        // Both shapes can be emitted without a subscriber installed
        TracingAuditLogger.record(&ok);
        TracingAuditLogger.record(&failed);
    }

    #[test]
    fn test_fan_out_reaches_every_logger() {
        let first = Arc::new(RecordingAuditLogger::default());
        let second = Arc::new(RecordingAuditLogger::default());
        let fan_out = FanOutAuditLogger::new()
            .with(first.clone())
            .with(Arc::new(NullAuditLogger))
            .with(second.clone());
        assert_eq!(fan_out.len(), 3);

        let record = AuditRecord::success(OmAction::CreateVolume, params(), UserInfo::new("bob"), 1);
        fan_out.record(&record);
        assert_eq!(first.records(), vec![record.clone()]);
        assert_eq!(second.records(), vec![record]);
    }
}
