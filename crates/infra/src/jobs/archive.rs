//! Durable archive of job records behind the TTL-bound cache.
//!
//! The tracker mirrors each record here on creation and on every status
//! change, and reads it back once the cached copy has expired.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use bulkscan_core::{JobId, JobRecord};

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobArchive;

/// Archive error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive storage error: {0}")]
    Storage(String),
    #[error("archived record is malformed: {0}")]
    Malformed(String),
}

/// Durable job record storage.
pub trait JobArchive: Send + Sync {
    /// Insert or replace the record.
    fn save(&self, record: &JobRecord) -> Result<(), ArchiveError>;

    fn load(&self, id: JobId) -> Result<Option<JobRecord>, ArchiveError>;
}

/// In-memory archive for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryJobArchive {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobArchive for InMemoryJobArchive {
    fn save(&self, record: &JobRecord) -> Result<(), ArchiveError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        Ok(())
    }

    fn load(&self, id: JobId) -> Result<Option<JobRecord>, ArchiveError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }
}

impl<A: JobArchive + ?Sized> JobArchive for std::sync::Arc<A> {
    fn save(&self, record: &JobRecord) -> Result<(), ArchiveError> {
        (**self).save(record)
    }

    fn load(&self, id: JobId) -> Result<Option<JobRecord>, ArchiveError> {
        (**self).load(id)
    }
}
