//! Drives one bulk scan job through rate-limited batches.
//!
//! Items are processed in list order, so the job's `processed` counter is
//! also the resume cursor: a deferred or interrupted run picks up at the
//! first unprocessed item.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bulkscan_core::{
    AdmissionHold, BatchPlan, ItemError, ItemOutcome, JobId, JobStatus, PartialCommitLog,
    optimal_batch_size,
};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use super::commit_log::CommitLogStore;
use super::tracker::{JobTracker, TrackerError};
use super::types::{ItemProcessor, RetryPolicy, RunOutcome};
use crate::rate_limit::RateLimiter;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Target duration of one batch at the admission rates
    pub batch_window: Duration,
    /// Upper bound on items per batch
    pub max_batch_size: usize,
    /// Retries of an item hitting storage contention
    pub contention_retry: RetryPolicy,
    /// Longest admission wait slept in place; longer waits defer the job
    pub max_inline_wait: Duration,
    /// Passed to the processor as its `commit` flag
    pub commit_items: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_secs(10),
            max_batch_size: 100,
            contention_retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(100),
                Duration::from_secs(2),
            ),
            max_inline_wait: Duration::from_millis(250),
            commit_items: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("item list missing for job {0}")]
    ItemsMissing(JobId),
    #[error(transparent)]
    Tracker(TrackerError),
}

impl From<TrackerError> for OrchestratorError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::NotFound(id) => OrchestratorError::JobNotFound(id),
            other => OrchestratorError::Tracker(other),
        }
    }
}

/// Admission of one item.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Admission {
    Granted,
    /// The wait is too long to sleep in place; `hold` keeps what was already charged.
    Deferred { hold: AdmissionHold, wait: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    processed: u64,
    succeeded: u64,
    failed: u64,
}

pub struct BatchOrchestrator {
    tracker: Arc<JobTracker>,
    commit_log: Arc<CommitLogStore>,
    dns: Arc<dyn RateLimiter>,
    whois: Arc<dyn RateLimiter>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("dns", &self.dns.name())
            .field("whois", &self.whois.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    pub fn new(
        tracker: Arc<JobTracker>,
        commit_log: Arc<CommitLogStore>,
        dns: Arc<dyn RateLimiter>,
        whois: Arc<dyn RateLimiter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            tracker,
            commit_log,
            dns,
            whois,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Items per batch: what both admission limiters sustain over one window.
    pub fn batch_size(&self) -> usize {
        optimal_batch_size(
            self.dns.rate(),
            self.whois.rate(),
            self.config.batch_window.as_secs_f64(),
            self.config.max_batch_size,
        )
    }

    /// Process the job's remaining items.
    ///
    /// Returns [`RunOutcome::Deferred`] when an admission limiter asks for a
    /// wait longer than `max_inline_wait`; running the job again continues
    /// where this run stopped.
    pub fn run(
        &self,
        job_id: JobId,
        processor: &dyn ItemProcessor,
    ) -> Result<RunOutcome, OrchestratorError> {
        let job = self.tracker.get_job(job_id)?;
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "job already finished");
            return Ok(RunOutcome::Completed {
                succeeded: job.succeeded,
                failed: job.failed,
            });
        }

        let Some(items) = self.tracker.get_items(job_id)? else {
            error!(job_id = %job_id, "item list not found");
            self.tracker.set_status(job_id, JobStatus::Failed)?;
            return Err(OrchestratorError::ItemsMissing(job_id));
        };

        self.tracker.set_status(job_id, JobStatus::Running)?;

        let plan = BatchPlan::new(items.len(), self.batch_size());
        let mut counters = Counters {
            processed: job.processed,
            succeeded: job.succeeded,
            failed: job.failed,
        };
        let mut cursor = usize::try_from(job.processed)
            .unwrap_or(usize::MAX)
            .min(items.len());
        let mut hold = job.admission_for(job.processed);

        while cursor < items.len() {
            let batch = plan.batch_of(cursor);
            let bounds = plan.bounds(batch);
            let mut log = self.open_log(job_id, batch, &plan, cursor - bounds.start);

            info!(
                bulk_id = %job_id,
                batch_no = log.batch_no,
                total_batches = log.total_batches,
                batch_size = bounds.len(),
                "batch started"
            );

            for item in &items[cursor..bounds.end] {
                if let Admission::Deferred { hold: held, wait: resume_after } =
                    self.admit(cursor as u64, hold.take())
                {
                    self.tracker.hold_admission(job_id, held)?;
                    self.persist(&log);
                    info!(
                        bulk_id = %job_id,
                        batch_no = log.batch_no,
                        processed = counters.processed,
                        resume_after_ms = resume_after.as_millis() as u64,
                        "job deferred by rate limits"
                    );
                    return Ok(RunOutcome::Deferred { resume_after });
                }

                let error = match self.process_item(job_id, item, processor) {
                    ItemOutcome::Success(result) => {
                        self.tracker.store_result(job_id, item, &result)?;
                        counters.succeeded += 1;
                        log.commit(item.as_str());
                        None
                    }
                    ItemOutcome::Failure { error, .. } => {
                        counters.failed += 1;
                        log.fail(item.as_str(), error.as_str());
                        Some(ItemError::new(item.as_str(), error))
                    }
                };
                counters.processed += 1;
                cursor += 1;

                self.tracker.update_progress(
                    job_id,
                    counters.processed,
                    counters.succeeded,
                    counters.failed,
                    error,
                )?;
            }

            log.finish();
            self.persist(&log);
            info!(
                bulk_id = %job_id,
                batch_no = log.batch_no,
                total_batches = log.total_batches,
                committed = log.committed.len(),
                failed = log.failed.len(),
                "batch finished"
            );
        }

        self.tracker.set_status(job_id, JobStatus::Completed)?;
        info!(
            job_id = %job_id,
            mode = %job.mode,
            succeeded = counters.succeeded,
            failed = counters.failed,
            "bulk scan completed"
        );
        Ok(RunOutcome::Completed {
            succeeded: counters.succeeded,
            failed: counters.failed,
        })
    }

    /// The batch record to append to: the stored in-flight record when
    /// resuming inside its batch with `done` items already recorded, a fresh
    /// one otherwise.
    fn open_log(&self, job_id: JobId, batch: usize, plan: &BatchPlan, done: usize) -> PartialCommitLog {
        let batch_no = batch as u64 + 1;
        let total_batches = plan.total_batches() as u64;

        if done > 0 {
            match self.commit_log.get(job_id) {
                Ok(Some(log))
                    if log.batch_no == batch_no && !log.is_finished() && log.recorded() == done =>
                {
                    return log;
                }
                Ok(_) => {
                    warn!(bulk_id = %job_id, batch_no, "no matching in-flight commit log, starting a new record");
                }
                Err(e) => warn!(bulk_id = %job_id, error = %e, "failed to load in-flight commit log"),
            }
        }
        PartialCommitLog::begin(job_id, batch_no, total_batches)
    }

    fn persist(&self, log: &PartialCommitLog) {
        if let Err(e) = self.commit_log.store(log) {
            warn!(
                bulk_id = %log.bulk_id,
                batch_no = log.batch_no,
                error = %e,
                "failed to store partial commit log"
            );
        }
    }

    /// One token from each admission limiter, DNS then WHOIS.
    ///
    /// A limiter wait reserves the token: short waits are slept here, a
    /// longer one is returned as a hold so the resumed run only sits out
    /// what is left of it. Limiters the hold already passed are not asked again.
    fn admit(&self, item: u64, hold: Option<AdmissionHold>) -> Admission {
        let limiters = [&self.dns, &self.whois];
        let (mut granted, mut ready_at) = match hold {
            Some(hold) => (usize::from(hold.granted), Some(hold.ready_at)),
            None => (0, None),
        };

        loop {
            if let Some(at) = ready_at.take() {
                let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if remaining > self.config.max_inline_wait {
                    debug!(item, granted, wait_ms = remaining.as_millis() as u64, "admission wait too long");
                    return Admission::Deferred {
                        hold: AdmissionHold {
                            item,
                            granted: granted as u8,
                            ready_at: at,
                        },
                        wait: remaining,
                    };
                }
                thread::sleep(remaining);
            }

            let Some(limiter) = limiters.get(granted) else {
                return Admission::Granted;
            };
            let wait = limiter.wait(1);
            granted += 1;
            if !wait.is_zero() {
                debug!(limiter = %limiter.name(), wait_ms = wait.as_millis() as u64, "admission wait");
                ready_at = Some(deadline(wait));
            }
        }
    }

    fn process_item(&self, job_id: JobId, item: &str, processor: &dyn ItemProcessor) -> ItemOutcome {
        let policy = &self.config.contention_retry;
        let mut attempt = 1;

        loop {
            let outcome = match processor.process(item, self.config.commit_items) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(job_id = %job_id, item, error = %e, "item processor error");
                    ItemOutcome::failure(format!("{e:#}"))
                }
            };

            if !outcome.is_retryable() || !policy.should_retry(attempt) {
                if let ItemOutcome::Failure { error, .. } = &outcome {
                    debug!(job_id = %job_id, item, attempts = attempt, error = %error, "item failed");
                }
                return outcome;
            }

            let delay = policy.delay_for_attempt(attempt);
            debug!(
                job_id = %job_id,
                item,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "storage contention, retrying item"
            );
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

fn deadline(wait: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(wait)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
