//! Replay detection
//!
//! The replicated log is at-least-once: after a leadership change entries
//! that were already applied are delivered again. A command is a replay
//! when the entity it targets already carries an update id at or past the
//! command's log index, or when its log index is already durable.
//!
//! Log indexes start at 1; 0 means nothing has been applied.

use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::LogIndex;

/// `true` when an entity last mutated at `update_id` already reflects the
/// command at `log_index`
pub fn is_replay(update_id: LogIndex, log_index: LogIndex) -> bool {
    update_id >= log_index
}

#[derive(Debug, Default)]
pub struct ReplayDetector {
    durable_index: AtomicU64,
}

impl ReplayDetector {
    pub fn new(durable_index: LogIndex) -> Self {
        Self {
            durable_index: AtomicU64::new(durable_index),
        }
    }

    pub fn durable_index(&self) -> LogIndex {
        self.durable_index.load(Ordering::SeqCst)
    }

    /// Record that everything up to `index` is durable; never moves back
    pub fn advance_durable(&self, index: LogIndex) {
        self.durable_index.fetch_max(index, Ordering::SeqCst);
    }

    /// `observed` is the version of the target entity (tombstones included).
    /// The durable index only covers applied commands because commands
    /// reach the flush pipeline in log order.
    pub fn check(&self, observed: Option<LogIndex>, log_index: LogIndex) -> bool {
        let durable = self.durable_index();
        (durable > 0 && log_index <= durable)
            || observed.is_some_and(|update_id| is_replay(update_id, log_index))
    }
}
