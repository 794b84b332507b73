//! Bulk scan job system: tracking, batch orchestration, queueing and execution.
//!
//! ## Components
//!
//! - `JobTracker`: job records, item lists and per-item results in the shared store
//! - `CommitLogStore`: per-batch partial commit logs for recovery
//! - `JobArchive`: durable copy of job records behind the TTL-bound cache
//! - `BatchOrchestrator`: drives one job through rate-limited batches
//! - `ScanQueue` / `BulkScanExecutor`: submission, deferral and the worker loop

pub mod archive;
pub mod commit_log;
pub mod executor;
pub mod orchestrator;
pub mod queue;
pub mod tracker;
pub mod types;

pub use archive::{ArchiveError, InMemoryJobArchive, JobArchive};
#[cfg(feature = "postgres")]
pub use archive::PostgresJobArchive;
pub use commit_log::{CommitLogError, CommitLogStore};
pub use executor::{BulkScanExecutor, ExecutorConfig, ExecutorError, ExecutorHandle, ExecutorStats};
pub use orchestrator::{BatchOrchestrator, OrchestratorConfig, OrchestratorError};
pub use queue::{InMemoryScanQueue, QueueError, ScanQueue};
pub use tracker::{JobTracker, TrackerError};
pub use types::{BackoffStrategy, ItemProcessor, RetryPolicy, RunOutcome};
