//! Persistence of partial commit logs.
//!
//! `bulk_log:{id}` holds the latest batch record of a job and
//! `bulk_log:{id}:batches` keeps every batch record keyed by batch number.
//! Both outlive the job's tracking keys.

use std::sync::Arc;
use std::time::Duration;

use bulkscan_core::{JobId, PartialCommitLog};

use crate::kv::{KeyValueStore, KvError};

/// Default lifetime of commit logs.
pub const DEFAULT_COMMIT_LOG_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, thiserror::Error)]
pub enum CommitLogError {
    #[error("store error: {0}")]
    Store(#[from] KvError),
    #[error("malformed commit log: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct CommitLogStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl std::fmt::Debug for CommitLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLogStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn latest_key(id: JobId) -> String {
    format!("bulk_log:{id}")
}

fn batches_key(id: JobId) -> String {
    format!("bulk_log:{id}:batches")
}

impl CommitLogStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Persist `log` as the job's latest batch record and into its batch history.
    pub fn store(&self, log: &PartialCommitLog) -> Result<(), CommitLogError> {
        let raw = serde_json::to_string(log)?;
        self.store.set_ex(&latest_key(log.bulk_id), &raw, self.ttl)?;

        let history = batches_key(log.bulk_id);
        self.store.hset(&history, &log.batch_no.to_string(), &raw)?;
        self.store.expire(&history, self.ttl)?;
        Ok(())
    }

    /// Latest batch record, `None` if none was stored or it expired.
    pub fn get(&self, bulk_id: JobId) -> Result<Option<PartialCommitLog>, CommitLogError> {
        match self.store.get(&latest_key(bulk_id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every stored batch record of the job, by batch number.
    pub fn history(&self, bulk_id: JobId) -> Result<Vec<PartialCommitLog>, CommitLogError> {
        let mut logs = self
            .store
            .hget_all(&batches_key(bulk_id))?
            .into_values()
            .map(|raw| serde_json::from_str::<PartialCommitLog>(&raw))
            .collect::<Result<Vec<_>, _>>()?;
        logs.sort_by_key(|log| log.batch_no);
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKeyValueStore;

    fn commit_logs() -> CommitLogStore {
        CommitLogStore::new(Arc::new(InMemoryKeyValueStore::new()), DEFAULT_COMMIT_LOG_TTL)
    }

    #[test]
    fn latest_record_replaces_previous_batch() {
        let logs = commit_logs();
        let id = JobId::new();

        let mut first = PartialCommitLog::begin(id, 1, 2);
        first.commit("a.com");
        first.finish();
        logs.store(&first).unwrap();

        let mut second = PartialCommitLog::begin(id, 2, 2);
        second.fail("b.com", "deadlock detected");
        logs.store(&second).unwrap();

        let latest = logs.get(id).unwrap().unwrap();
        assert_eq!(latest.batch_no, 2);
        assert!(!latest.is_finished());
        assert_eq!(latest.failed[0].item, "b.com");

        let history = logs.history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], first);
        assert_eq!(history[1].batch_no, 2);
    }

    #[test]
    fn rewriting_a_batch_updates_its_history_entry() {
        let logs = commit_logs();
        let id = JobId::new();

        let mut batch = PartialCommitLog::begin(id, 1, 1);
        batch.commit("a.com");
        logs.store(&batch).unwrap();
        batch.commit("b.com");
        batch.finish();
        logs.store(&batch).unwrap();

        let history = logs.history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].committed, vec!["a.com", "b.com"]);
    }

    #[test]
    fn absent_log_is_none() {
        let logs = commit_logs();
        assert!(logs.get(JobId::new()).unwrap().is_none());
        assert!(logs.history(JobId::new()).unwrap().is_empty());
    }
}
