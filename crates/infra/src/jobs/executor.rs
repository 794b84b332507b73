//! Bulk scan executor: job submission and the worker loop.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bulkscan_core::{JobId, JobRecord, JobStatus, ScanMode};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::orchestrator::{BatchOrchestrator, OrchestratorError};
use super::queue::{QueueError, ScanQueue};
use super::tracker::{JobTracker, TrackerError};
use super::types::{ItemProcessor, RunOutcome};

/// Default number of items per submitted job.
pub const DEFAULT_SUBMIT_CHUNK_SIZE: usize = 100;

/// Executor error.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no processor registered for {0} jobs")]
    NoProcessor(ScanMode),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Executor loop configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How often to poll for ready jobs
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "bulk-scan-executor".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct ExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl ExecutorHandle {
    /// Request graceful shutdown; waits for the current job run to end.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub runs: u64,
    pub jobs_completed: u64,
    pub jobs_deferred: u64,
    pub jobs_failed: u64,
    pub uptime_secs: u64,
}

fn lock_stats(stats: &Mutex<ExecutorStats>) -> MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Submits bulk scan jobs and drives queued jobs through the orchestrator.
pub struct BulkScanExecutor<Q: ScanQueue> {
    tracker: Arc<JobTracker>,
    orchestrator: BatchOrchestrator,
    queue: Q,
    processors: HashMap<ScanMode, Arc<dyn ItemProcessor>>,
    submit_chunk_size: usize,
}

impl<Q: ScanQueue + 'static> BulkScanExecutor<Q> {
    pub fn new(tracker: Arc<JobTracker>, orchestrator: BatchOrchestrator, queue: Q) -> Self {
        Self {
            tracker,
            orchestrator,
            queue,
            processors: HashMap::new(),
            submit_chunk_size: DEFAULT_SUBMIT_CHUNK_SIZE,
        }
    }

    /// Lists longer than `size` are split into several jobs.
    pub fn with_submit_chunk_size(mut self, size: usize) -> Self {
        self.submit_chunk_size = size.max(1);
        self
    }

    /// Register the processor for jobs of `mode`.
    pub fn register_processor<P>(&mut self, mode: ScanMode, processor: P)
    where
        P: ItemProcessor + 'static,
    {
        self.processors.insert(mode, Arc::new(processor));
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Create and enqueue jobs over `items`, one per `submit_chunk_size` items.
    pub fn submit<I>(&self, items: I, mode: ScanMode) -> Result<Vec<JobId>, ExecutorError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        if !self.processors.contains_key(&mode) {
            return Err(ExecutorError::NoProcessor(mode));
        }

        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        let mut ids = Vec::new();
        for chunk in items.chunks(self.submit_chunk_size) {
            let id = self.tracker.create_job(chunk.iter().cloned(), mode)?;
            self.queue.enqueue(id, None)?;
            ids.push(id);
        }

        if ids.len() > 1 {
            info!(jobs = ids.len(), items = items.len(), mode = %mode, "bulk submission split into jobs");
        }
        Ok(ids)
    }

    pub fn get_job(&self, id: JobId) -> Result<JobRecord, TrackerError> {
        self.tracker.get_job(id)
    }

    pub fn get_results(&self, id: JobId) -> Result<Vec<serde_json::Value>, TrackerError> {
        self.tracker.get_results(id)
    }

    /// Claim and drive one ready job. `Ok(None)` when nothing is ready.
    ///
    /// A deferred job is put back on the queue, ready after its `resume_after`.
    pub fn run_one(&self) -> Result<Option<(JobId, RunOutcome)>, ExecutorError> {
        let Some(job_id) = self.queue.claim_next()? else {
            return Ok(None);
        };

        match self.execute(job_id) {
            Ok(outcome) => Ok(Some((job_id, outcome))),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "bulk scan job failed");
                Err(e)
            }
        }
    }

    fn execute(&self, job_id: JobId) -> Result<RunOutcome, ExecutorError> {
        let job = self.tracker.get_job(job_id)?;
        let Some(processor) = self.processors.get(&job.mode).cloned() else {
            self.fail(job_id);
            return Err(ExecutorError::NoProcessor(job.mode));
        };

        match self.orchestrator.run(job_id, processor.as_ref()) {
            Ok(RunOutcome::Deferred { resume_after }) => {
                let not_before = chrono::Duration::from_std(resume_after)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay));
                self.queue.enqueue(job_id, not_before)?;
                debug!(job_id = %job_id, resume_after_ms = resume_after.as_millis() as u64, "job re-enqueued");
                Ok(RunOutcome::Deferred { resume_after })
            }
            Ok(outcome) => Ok(outcome),
            Err(OrchestratorError::Tracker(e)) => {
                self.fail(job_id);
                Err(OrchestratorError::Tracker(e).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fail(&self, job_id: JobId) {
        if let Err(e) = self.tracker.set_status(job_id, JobStatus::Failed) {
            warn!(job_id = %job_id, error = %e, "failed to mark job failed");
        }
    }

    /// Spawn the executor loop in a background thread.
    pub fn spawn(self, config: ExecutorConfig) -> std::io::Result<ExecutorHandle>
    where
        Q: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                executor_loop(self, config, shutdown_rx, stats_clone);
            })?;

        Ok(ExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn executor_loop<Q: ScanQueue + 'static>(
    executor: BulkScanExecutor<Q>,
    config: ExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "bulk scan executor started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        lock_stats(&stats).uptime_secs = start_time.elapsed().as_secs();

        match executor.run_one() {
            Ok(Some((job_id, outcome))) => {
                let mut s = lock_stats(&stats);
                s.runs += 1;
                match outcome {
                    RunOutcome::Completed { .. } => s.jobs_completed += 1,
                    RunOutcome::Deferred { .. } => s.jobs_deferred += 1,
                }
                debug!(executor = %config.name, job_id = %job_id, outcome = ?outcome, "job run finished");
            }
            Ok(None) => {
                thread::sleep(config.poll_interval);
            }
            Err(ExecutorError::Queue(e)) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
            Err(_) => {
                let mut s = lock_stats(&stats);
                s.runs += 1;
                s.jobs_failed += 1;
            }
        }
    }

    info!(executor = %config.name, "bulk scan executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkscan_core::ItemOutcome;
    use serde_json::json;

    use crate::jobs::commit_log::{CommitLogStore, DEFAULT_COMMIT_LOG_TTL};
    use crate::jobs::orchestrator::OrchestratorConfig;
    use crate::jobs::queue::InMemoryScanQueue;
    use crate::jobs::tracker::DEFAULT_JOB_TTL;
    use crate::kv::InMemoryKeyValueStore;
    use crate::rate_limit::TokenBucket;

    fn executor(whois_rate: f64) -> BulkScanExecutor<Arc<InMemoryScanQueue>> {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let tracker = Arc::new(JobTracker::new(store.clone(), DEFAULT_JOB_TTL));
        let commit_log = Arc::new(CommitLogStore::new(store, DEFAULT_COMMIT_LOG_TTL));
        let orchestrator = BatchOrchestrator::new(
            tracker.clone(),
            commit_log,
            Arc::new(TokenBucket::new("dns", 1_000.0, None)),
            Arc::new(TokenBucket::new("whois", whois_rate, Some(1.0))),
            OrchestratorConfig {
                max_inline_wait: Duration::from_millis(10),
                ..OrchestratorConfig::default()
            },
        );

        let mut executor = BulkScanExecutor::new(tracker, orchestrator, InMemoryScanQueue::arc());
        executor.register_processor(ScanMode::Scan, |item: &str, _commit: bool| -> anyhow::Result<ItemOutcome> {
            Ok(ItemOutcome::success(json!({ "domain": item })))
        });
        executor
    }

    #[test]
    fn submitted_job_runs_to_completion() {
        let executor = executor(1_000.0);
        let ids = executor.submit(["a.com", "b.com"], ScanMode::Scan).unwrap();
        assert_eq!(ids.len(), 1);

        let (job_id, outcome) = executor.run_one().unwrap().unwrap();
        assert_eq!(job_id, ids[0]);
        assert_eq!(outcome, RunOutcome::Completed { succeeded: 2, failed: 0 });
        assert_eq!(executor.get_job(job_id).unwrap().status, JobStatus::Completed);
        assert_eq!(executor.get_results(job_id).unwrap().len(), 2);
        assert!(executor.run_one().unwrap().is_none());
    }

    #[test]
    fn long_lists_are_split_into_jobs() {
        let executor = executor(1_000.0).with_submit_chunk_size(2);
        let items: Vec<String> = (0..5).map(|i| format!("d{i}.com")).collect();

        let ids = executor.submit(items, ScanMode::Scan).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(executor.queue().len(), 3);

        let totals: Vec<u64> = ids
            .iter()
            .map(|id| executor.get_job(*id).unwrap().total)
            .collect();
        assert_eq!(totals, vec![2, 2, 1]);
    }

    #[test]
    fn deferred_jobs_go_back_on_the_queue() {
        let executor = executor(1.0);
        let id = executor.submit(["a.com", "b.com"], ScanMode::Scan).unwrap()[0];

        let (_, outcome) = executor.run_one().unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Deferred { .. }));
        assert_eq!(executor.queue().len(), 1);
        assert_eq!(executor.get_job(id).unwrap().processed, 1);

        // Not ready until the limiter has refilled.
        assert!(executor.run_one().unwrap().is_none());
    }

    #[test]
    fn unregistered_mode_is_rejected() {
        let executor = executor(1_000.0);
        let err = executor.submit(["a.com"], ScanMode::Rescan).unwrap_err();
        assert!(matches!(err, ExecutorError::NoProcessor(ScanMode::Rescan)));
        assert!(executor.queue().is_empty());
    }

    #[test]
    fn spawned_executor_drains_the_queue() {
        let executor = executor(1_000.0);
        let ids = executor.submit(["a.com", "b.com"], ScanMode::Scan).unwrap();
        let second = executor.submit(["c.com"], ScanMode::Scan).unwrap();
        let tracker = executor.tracker.clone();

        let handle = executor
            .spawn(ExecutorConfig::default().with_poll_interval(Duration::from_millis(5)))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_completed < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.jobs_failed, 0);
        for id in ids.iter().chain(&second) {
            assert_eq!(tracker.get_job(*id).unwrap().status, JobStatus::Completed);
        }
    }
}
