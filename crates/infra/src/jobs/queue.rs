//! Queue of jobs waiting for a worker.

use std::sync::{Arc, PoisonError, RwLock};

use bulkscan_core::JobId;
use chrono::{DateTime, Utc};

/// Scan queue abstraction.
pub trait ScanQueue: Send + Sync {
    /// Enqueue a job, ready immediately or from `not_before` on.
    fn enqueue(&self, job_id: JobId, not_before: Option<DateTime<Utc>>) -> Result<(), QueueError>;

    /// Take the job that has been ready the longest.
    /// Returns None if no job is ready.
    fn claim_next(&self) -> Result<Option<JobId>, QueueError>;

    /// Number of queued jobs, ready or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scan queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job already queued: {0}")]
    AlreadyQueued(JobId),
    #[error("queue storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone)]
struct Entry {
    job_id: JobId,
    ready_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
    next_seq: u64,
}

/// In-memory scan queue for tests/dev and single-process workers.
#[derive(Debug, Default)]
pub struct InMemoryScanQueue {
    inner: RwLock<Inner>,
}

impl InMemoryScanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl ScanQueue for InMemoryScanQueue {
    fn enqueue(&self, job_id: JobId, not_before: Option<DateTime<Utc>>) -> Result<(), QueueError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.iter().any(|e| e.job_id == job_id) {
            return Err(QueueError::AlreadyQueued(job_id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(Entry {
            job_id,
            ready_at: not_before.unwrap_or_else(Utc::now),
            seq,
        });
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<JobId>, QueueError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();

        // Oldest readiness first, FIFO among equals.
        let next = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ready_at <= now)
            .min_by_key(|(_, e)| (e.ready_at, e.seq))
            .map(|(index, _)| index);

        Ok(next.map(|index| inner.entries.swap_remove(index).job_id))
    }

    fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }
}

impl<Q: ScanQueue + ?Sized> ScanQueue for Arc<Q> {
    fn enqueue(&self, job_id: JobId, not_before: Option<DateTime<Utc>>) -> Result<(), QueueError> {
        (**self).enqueue(job_id, not_before)
    }

    fn claim_next(&self) -> Result<Option<JobId>, QueueError> {
        (**self).claim_next()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_in_enqueue_order() {
        let queue = InMemoryScanQueue::new();
        let first = JobId::new();
        let second = JobId::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        queue.enqueue(first, Some(past)).unwrap();
        queue.enqueue(second, Some(past)).unwrap();

        assert_eq!(queue.claim_next().unwrap(), Some(first));
        assert_eq!(queue.claim_next().unwrap(), Some(second));
        assert_eq!(queue.claim_next().unwrap(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn delayed_jobs_wait_for_their_time() {
        let queue = InMemoryScanQueue::new();
        let later = JobId::new();
        let now = JobId::new();
        queue
            .enqueue(later, Some(Utc::now() + chrono::Duration::milliseconds(50)))
            .unwrap();
        queue.enqueue(now, None).unwrap();

        assert_eq!(queue.claim_next().unwrap(), Some(now));
        assert_eq!(queue.claim_next().unwrap(), None);
        assert_eq!(queue.len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(80));
        assert_eq!(queue.claim_next().unwrap(), Some(later));
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let queue = InMemoryScanQueue::new();
        let id = JobId::new();
        queue.enqueue(id, None).unwrap();
        assert!(matches!(queue.enqueue(id, None), Err(QueueError::AlreadyQueued(_))));
    }
}
