//! Partial commit log: which items of a batch committed and which failed.
//!
//! The record outlives the job's own tracking state so that a crashed worker
//! leaves enough behind to reconstruct what was already committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// An item that did not commit, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: String,
    pub error: String,
}

/// Commit record of one batch of a bulk job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCommitLog {
    pub bulk_id: JobId,
    /// 1-based batch number.
    pub batch_no: u64,
    pub total_batches: u64,
    pub committed: Vec<String>,
    pub failed: Vec<FailedItem>,
    pub batch_start_time: DateTime<Utc>,
    /// `None` while the batch is still in flight.
    pub batch_end_time: Option<DateTime<Utc>>,
}

impl PartialCommitLog {
    /// Open the record for a batch that starts now.
    pub fn begin(bulk_id: JobId, batch_no: u64, total_batches: u64) -> Self {
        Self {
            bulk_id,
            batch_no,
            total_batches,
            committed: Vec::new(),
            failed: Vec::new(),
            batch_start_time: Utc::now(),
            batch_end_time: None,
        }
    }

    pub fn commit(&mut self, item: impl Into<String>) {
        self.committed.push(item.into());
    }

    pub fn fail(&mut self, item: impl Into<String>, error: impl Into<String>) {
        self.failed.push(FailedItem {
            item: item.into(),
            error: error.into(),
        });
    }

    pub fn finish(&mut self) {
        self.batch_end_time = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.batch_end_time.is_some()
    }

    /// Number of items of the batch already accounted for.
    pub fn recorded(&self) -> usize {
        self.committed.len() + self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commit_fail_finish() {
        let mut log = PartialCommitLog::begin(JobId::new(), 2, 5);
        log.commit("a.com");
        log.fail("b.com", "deadlock detected");
        assert!(!log.is_finished());
        assert_eq!(log.recorded(), 2);

        log.finish();
        assert!(log.is_finished());
        assert_eq!(log.committed, vec!["a.com".to_string()]);
        assert_eq!(log.failed[0].item, "b.com");
    }

    #[test]
    fn json_shape_uses_snake_case_fields() {
        let log = PartialCommitLog::begin(JobId::new(), 1, 1);
        let value = serde_json::to_value(&log).unwrap();
        for field in ["bulk_id", "batch_no", "total_batches", "committed", "failed", "batch_start_time", "batch_end_time"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }
}
