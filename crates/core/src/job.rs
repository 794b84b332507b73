//! Bulk scan job record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::item::ScanMode;

/// Job execution status.
///
/// `pending -> running -> completed`, `pending -> failed`, `running -> failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for a worker
    Pending,
    /// A worker is driving the job
    Running,
    /// Every item has been processed
    Completed,
    /// The job could not be driven to the end
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `next` may follow `self`. Re-asserting the current status is allowed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-item failure recorded on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: String,
    pub message: String,
    /// Assigned by the tracker when the caller leaves it empty.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ItemError {
    pub fn new(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            message: message.into(),
            timestamp: None,
        }
    }
}

/// Admission already granted to the next unprocessed item by a run that was
/// deferred before it could process the item.
///
/// A limiter wait is a reservation: the item proceeds once `ready_at` has
/// passed without asking the limiters in `granted` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionHold {
    /// Position of the item in the job's list
    pub item: u64,
    /// Number of admission limiters already passed, in admission order
    pub granted: u8,
    /// Earliest time the item may proceed
    pub ready_at: DateTime<Utc>,
}

/// Tracking state of one bulk scan job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub mode: ScanMode,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    #[serde(default)]
    pub progress_percent: u64,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionHold>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh pending job over `total` items.
    pub fn new(id: JobId, mode: ScanMode, total: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            mode,
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            progress_percent: 0,
            errors: Vec::new(),
            admission: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the counters, append `error` (timestamped now if it has no
    /// timestamp) and recompute the progress percentage. An admission hold on
    /// an item now counted as processed is dropped.
    pub fn record_progress(
        &mut self,
        processed: u64,
        succeeded: u64,
        failed: u64,
        error: Option<ItemError>,
    ) {
        let now = Utc::now();
        self.processed = processed;
        self.succeeded = succeeded;
        self.failed = failed;
        if let Some(mut error) = error {
            error.timestamp.get_or_insert(now);
            self.errors.push(error);
        }
        if self.admission.is_some_and(|hold| hold.item < processed) {
            self.admission = None;
        }
        self.progress_percent = if self.total > 0 {
            processed.saturating_mul(100) / self.total
        } else {
            0
        };
        self.updated_at = now;
    }

    /// Move to `next`, enforcing the status machine.
    pub fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Lazy completion: a running job whose counters already cover every item
    /// is completed. Returns `true` when the status changed.
    pub fn settle(&mut self) -> bool {
        if self.status == JobStatus::Running && self.processed >= self.total {
            self.status = JobStatus::Completed;
            self.updated_at = Utc::now();
            return true;
        }
        false
    }

    /// Hold the admission granted to item `hold.item`.
    pub fn hold_admission(&mut self, hold: AdmissionHold) {
        self.admission = Some(hold);
        self.updated_at = Utc::now();
    }

    /// The hold covering item `item`, if any.
    pub fn admission_for(&self, item: u64) -> Option<AdmissionHold> {
        self.admission.filter(|hold| hold.item == item)
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(total: u64) -> JobRecord {
        JobRecord::new(JobId::new(), ScanMode::Scan, total)
    }

    #[test]
    fn new_job_is_pending_with_zeroed_counters() {
        let job = job(2);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total, 2);
        assert_eq!(job.processed, 0);
        assert!(job.errors.is_empty());
    }

    #[test]
    fn progress_percent_is_floored() {
        let mut job = job(3);
        job.record_progress(1, 1, 0, None);
        assert_eq!(job.progress_percent, 33);
        job.record_progress(2, 1, 1, None);
        assert_eq!(job.progress_percent, 66);
    }

    #[test]
    fn empty_job_reports_zero_progress() {
        let mut job = job(0);
        job.record_progress(0, 0, 0, None);
        assert_eq!(job.progress_percent, 0);
    }

    #[test]
    fn missing_error_timestamp_is_assigned() {
        let mut job = job(1);
        job.record_progress(1, 0, 1, Some(ItemError::new("a.com", "nxdomain")));
        assert_eq!(job.errors.len(), 1);
        assert!(job.errors[0].timestamp.is_some());
    }

    #[test]
    fn caller_supplied_timestamp_is_kept() {
        let mut job = job(1);
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut error = ItemError::new("a.com", "timeout");
        error.timestamp = Some(ts);
        job.record_progress(1, 0, 1, Some(error));
        assert_eq!(job.errors[0].timestamp, Some(ts));
    }

    #[test]
    fn status_machine() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn transition_rejects_leaving_terminal_state() {
        let mut job = job(1);
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        let err = job.transition(JobStatus::Running).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Running
            }
        );
    }

    #[test]
    fn settle_completes_only_running_jobs_that_are_done() {
        let mut pending = job(1);
        pending.record_progress(1, 1, 0, None);
        assert!(!pending.settle());
        assert_eq!(pending.status, JobStatus::Pending);

        let mut running = job(2);
        running.transition(JobStatus::Running).unwrap();
        running.record_progress(1, 1, 0, None);
        assert!(!running.settle());
        running.record_progress(2, 2, 0, None);
        assert!(running.settle());
        assert_eq!(running.status, JobStatus::Completed);
    }

    #[test]
    fn admission_hold_is_dropped_once_its_item_is_processed() {
        let mut job = job(3);
        job.record_progress(1, 1, 0, None);
        job.hold_admission(AdmissionHold {
            item: 1,
            granted: 1,
            ready_at: Utc::now(),
        });
        assert!(job.admission_for(1).is_some());
        assert!(job.admission_for(2).is_none());

        // Progress that does not reach the held item keeps the hold.
        job.record_progress(1, 1, 0, None);
        assert!(job.admission.is_some());

        job.record_progress(2, 2, 0, None);
        assert!(job.admission.is_none());
    }

    #[test]
    fn records_without_a_hold_still_deserialize() {
        let job = job(1);
        let mut value = serde_json::to_value(&job).unwrap();
        assert!(value.get("admission").is_none());
        value.as_object_mut().unwrap().remove("mode");
        let back: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.admission, None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
