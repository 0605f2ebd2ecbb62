//! Command log reader
//!
//! One JSON object per line:
//!
//! ```text
//! {"log_index": 12, "user": {"user_name": "alice"}, "request": {"type": "DeleteBucket", "volume": "vol1", "bucket": "bucket1"}}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::BufRead;
use strata_common::{LogIndex, UserInfo};
use strata_om::{OmRequest, OmResponse, OzoneManager};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct CommandEntry {
    pub log_index: LogIndex,
    #[serde(default)]
    pub user: UserInfo,
    pub request: OmRequest,
}

/// Outcome counts of one command log
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: u64,
    pub failed: u64,
    pub replayed: u64,
    pub last_index: LogIndex,
}

impl ApplySummary {
    fn record(&mut self, response: &OmResponse) {
        if response.replayed {
            self.replayed += 1;
        } else if response.is_success() {
            self.applied += 1;
        } else {
            self.failed += 1;
        }
        self.last_index = self.last_index.max(response.log_index);
    }
}

/// Apply every entry of `reader` in order. A malformed line stops the run.
pub fn apply_log(om: &OzoneManager, reader: impl BufRead) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.context("failed to read command log")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry: CommandEntry = serde_json::from_str(line)
            .with_context(|| format!("invalid command on line {}", line_no + 1))?;

        let response = om.apply(entry.log_index, &entry.request, &entry.user);
        if response.is_success() {
            info!(
                log_index = response.log_index,
                action = %response.action,
                status = %response.status,
                replayed = response.replayed,
                "Applied command"
            );
        } else {
            warn!(
                log_index = response.log_index,
                action = %response.action,
                status = %response.status,
                "Command failed"
            );
        }
        summary.record(&response);
    }
    Ok(summary)
}
