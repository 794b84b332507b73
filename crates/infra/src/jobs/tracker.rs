//! Job progress tracking in the shared key-value store.
//!
//! Layout per job: `job:{id}` (JSON record), `job:{id}:items` (JSON array of
//! item identifiers) and `job:{id}:results` (hash of item -> JSON result).
//! Every write refreshes the key's TTL.

use std::sync::Arc;
use std::time::Duration;

use bulkscan_core::{AdmissionHold, DomainError, ItemError, JobId, JobRecord, JobStatus, ScanMode};
use tracing::{info, warn};

use super::archive::{ArchiveError, JobArchive};
use crate::kv::{KeyValueStore, KvError};

/// Default lifetime of tracking keys.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(3600);

/// Job tracker error.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(#[from] DomainError),
    #[error("store error: {0}")]
    Store(#[from] KvError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("malformed job data: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct JobTracker {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    archive: Option<Arc<dyn JobArchive>>,
}

impl std::fmt::Debug for JobTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTracker")
            .field("ttl", &self.ttl)
            .field("archived", &self.archive.is_some())
            .finish_non_exhaustive()
    }
}

fn job_key(id: JobId) -> String {
    format!("job:{id}")
}

fn items_key(id: JobId) -> String {
    format!("job:{id}:items")
}

fn results_key(id: JobId) -> String {
    format!("job:{id}:results")
}

impl JobTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            archive: None,
        }
    }

    /// Mirror records into `archive` and read them back after the cache expires.
    pub fn with_archive(mut self, archive: Arc<dyn JobArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a pending job over `items`.
    pub fn create_job<I>(&self, items: I, mode: ScanMode) -> Result<JobId, TrackerError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        let record = JobRecord::new(JobId::new(), mode, items.len() as u64);

        self.save(&record)?;
        self.store
            .set_ex(&items_key(record.id), &serde_json::to_string(&items)?, self.ttl)?;
        self.mirror(&record);

        info!(job_id = %record.id, total = record.total, mode = %mode, "job created");
        Ok(record.id)
    }

    /// Current state of a job.
    ///
    /// A running job whose counters cover every item is reported (and stored)
    /// as completed.
    pub fn get_job(&self, id: JobId) -> Result<JobRecord, TrackerError> {
        let Some(mut record) = self.load(id)? else {
            return self.load_archived(id);
        };

        if record.settle() {
            self.save(&record)?;
            self.mirror(&record);
            info!(job_id = %id, succeeded = record.succeeded, failed = record.failed, "job completed");
        }
        Ok(record)
    }

    /// Overwrite the job's counters, appending `error` to its error list.
    pub fn update_progress(
        &self,
        id: JobId,
        processed: u64,
        succeeded: u64,
        failed: u64,
        error: Option<ItemError>,
    ) -> Result<(), TrackerError> {
        let mut record = self.load(id)?.ok_or(TrackerError::NotFound(id))?;
        record.record_progress(processed, succeeded, failed, error);
        self.save(&record)
    }

    /// Record the admission already granted to the job's next item, so a
    /// later run does not charge the limiters for it again.
    pub fn hold_admission(&self, id: JobId, hold: AdmissionHold) -> Result<(), TrackerError> {
        let mut record = self.load(id)?.ok_or(TrackerError::NotFound(id))?;
        record.hold_admission(hold);
        self.save(&record)
    }

    /// Move the job to `status`, rejecting transitions the status machine forbids.
    pub fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), TrackerError> {
        let mut record = self.load(id)?.ok_or(TrackerError::NotFound(id))?;
        if record.status == status {
            return Ok(());
        }

        let from = record.status;
        record.transition(status)?;
        self.save(&record)?;
        self.mirror(&record);

        info!(job_id = %id, from = %from, to = %status, "job status changed");
        Ok(())
    }

    /// Store the result of one item.
    pub fn store_result(
        &self,
        id: JobId,
        item: &str,
        result: &serde_json::Value,
    ) -> Result<(), TrackerError> {
        let key = results_key(id);
        self.store.hset(&key, item, &serde_json::to_string(result)?)?;
        self.store.expire(&key, self.ttl)?;
        Ok(())
    }

    /// Stored per-item results, ordered by item identifier.
    pub fn get_results(&self, id: JobId) -> Result<Vec<serde_json::Value>, TrackerError> {
        let mut fields: Vec<(String, String)> =
            self.store.hget_all(&results_key(id))?.into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        fields
            .into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(TrackerError::from))
            .collect()
    }

    /// The job's item list, `None` once it has expired.
    pub fn get_items(&self, id: JobId) -> Result<Option<Vec<String>>, TrackerError> {
        match self.store.get(&items_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn load(&self, id: JobId) -> Result<Option<JobRecord>, TrackerError> {
        match self.store.get(&job_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, record: &JobRecord) -> Result<(), TrackerError> {
        self.store
            .set_ex(&job_key(record.id), &serde_json::to_string(record)?, self.ttl)?;
        Ok(())
    }

    fn load_archived(&self, id: JobId) -> Result<JobRecord, TrackerError> {
        let Some(archive) = &self.archive else {
            return Err(TrackerError::NotFound(id));
        };
        let mut record = archive.load(id)?.ok_or(TrackerError::NotFound(id))?;
        record.settle();
        Ok(record)
    }

    // The cache stays authoritative; archive failures are logged only.
    fn mirror(&self, record: &JobRecord) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.save(record) {
                warn!(job_id = %record.id, error = %e, "failed to archive job record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::archive::InMemoryJobArchive;
    use crate::kv::InMemoryKeyValueStore;
    use serde_json::json;

    fn tracker() -> (Arc<InMemoryKeyValueStore>, JobTracker) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let tracker = JobTracker::new(store.clone(), DEFAULT_JOB_TTL);
        (store, tracker)
    }

    #[test]
    fn create_job_registers_pending_record_and_items() {
        let (_, tracker) = tracker();
        let id = tracker.create_job(["a.com", "b.com"], ScanMode::Scan).unwrap();

        let job = tracker.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total, 2);
        assert_eq!(job.processed, 0);
        assert_eq!(
            tracker.get_items(id).unwrap(),
            Some(vec!["a.com".to_string(), "b.com".to_string()])
        );
    }

    #[test]
    fn running_job_is_completed_once_every_item_is_processed() {
        let (_, tracker) = tracker();
        let id = tracker.create_job(["a.com", "b.com"], ScanMode::Scan).unwrap();
        tracker.set_status(id, JobStatus::Running).unwrap();

        tracker.update_progress(id, 1, 1, 0, None).unwrap();
        assert_eq!(tracker.get_job(id).unwrap().progress_percent, 50);

        tracker
            .update_progress(id, 2, 1, 1, Some(ItemError::new("b.com", "lookup failed")))
            .unwrap();
        let job = tracker.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100);
        assert_eq!(job.errors.len(), 1);
        assert!(job.errors[0].timestamp.is_some());

        // Written back, so a second read sees the same thing.
        assert_eq!(tracker.get_job(id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let (_, tracker) = tracker();
        let id = tracker.create_job(["a.com"], ScanMode::Scan).unwrap();

        let err = tracker.set_status(id, JobStatus::Completed).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition(_)));

        tracker.set_status(id, JobStatus::Failed).unwrap();
        assert!(tracker.set_status(id, JobStatus::Running).is_err());
        assert_eq!(tracker.get_job(id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let (_, tracker) = tracker();
        let id = JobId::new();
        assert!(matches!(tracker.get_job(id), Err(TrackerError::NotFound(_))));
        assert!(matches!(
            tracker.update_progress(id, 1, 1, 0, None),
            Err(TrackerError::NotFound(_))
        ));
        assert!(tracker.get_items(id).unwrap().is_none());
    }

    #[test]
    fn results_are_listed_in_item_order() {
        let (_, tracker) = tracker();
        let id = tracker.create_job(["b.com", "a.com"], ScanMode::Scan).unwrap();
        tracker.store_result(id, "b.com", &json!({ "score": 2 })).unwrap();
        tracker.store_result(id, "a.com", &json!({ "score": 1 })).unwrap();

        let results = tracker.get_results(id).unwrap();
        assert_eq!(results, vec![json!({ "score": 1 }), json!({ "score": 2 })]);
    }

    #[test]
    fn expired_records_fall_back_to_the_archive() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let archive = Arc::new(InMemoryJobArchive::new());
        let tracker = JobTracker::new(store.clone(), Duration::from_millis(30))
            .with_archive(archive.clone());

        let id = tracker.create_job(["a.com"], ScanMode::Rescan).unwrap();
        tracker.set_status(id, JobStatus::Running).unwrap();
        tracker.update_progress(id, 1, 1, 0, None).unwrap();
        assert_eq!(tracker.get_job(id).unwrap().status, JobStatus::Completed);

        std::thread::sleep(Duration::from_millis(60));
        assert!(store.get(&job_key(id)).unwrap().is_none());

        let job = tracker.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.mode, ScanMode::Rescan);
        assert_eq!(job.succeeded, 1);
    }

    #[test]
    fn admission_hold_survives_until_the_item_is_processed() {
        let (_, tracker) = tracker();
        let id = tracker.create_job(["a.com", "b.com"], ScanMode::Scan).unwrap();
        let hold = AdmissionHold {
            item: 0,
            granted: 2,
            ready_at: chrono::Utc::now(),
        };

        tracker.hold_admission(id, hold).unwrap();
        assert_eq!(tracker.get_job(id).unwrap().admission_for(0), Some(hold));

        tracker.update_progress(id, 1, 1, 0, None).unwrap();
        assert_eq!(tracker.get_job(id).unwrap().admission, None);
    }

    #[test]
    fn store_outage_surfaces_as_store_error() {
        let (store, tracker) = tracker();
        let id = tracker.create_job(["a.com"], ScanMode::Scan).unwrap();
        store.set_available(false);

        assert!(matches!(tracker.get_job(id), Err(TrackerError::Store(_))));
    }
}
