//! Explicit wiring of the shared store, admission limiters and job stores.
//!
//! One `ScanContext` per worker process; everything that needs a limiter or
//! the tracker receives it from here instead of from process-wide globals.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{ConfigError, ScanSettings};
use crate::jobs::{
    ArchiveError, BatchOrchestrator, BulkScanExecutor, CommitLogStore, JobArchive, JobTracker,
    ScanQueue,
};
use crate::kv::{InMemoryKeyValueStore, KeyValueStore, KvError};
use crate::rate_limit::DistributedLimiter;

/// Limiter identity of the DNS resolver budget.
pub const DNS_LIMITER: &str = "dns";
/// Limiter identity of the WHOIS budget.
pub const WHOIS_LIMITER: &str = "whois";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] KvError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub struct ScanContext {
    settings: ScanSettings,
    store: Arc<dyn KeyValueStore>,
    dns: Arc<DistributedLimiter>,
    whois: Arc<DistributedLimiter>,
    tracker: Arc<JobTracker>,
    commit_log: Arc<CommitLogStore>,
}

impl std::fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanContext")
            .field("settings", &self.settings)
            .field("dns", &self.dns)
            .field("whois", &self.whois)
            .finish_non_exhaustive()
    }
}

impl ScanContext {
    pub fn new(
        settings: ScanSettings,
        store: Arc<dyn KeyValueStore>,
        archive: Option<Arc<dyn JobArchive>>,
    ) -> Self {
        let dns = Arc::new(DistributedLimiter::new(
            DNS_LIMITER,
            settings.dns.rate,
            settings.dns.burst,
            store.clone(),
            settings.breaker,
        ));
        let whois = Arc::new(DistributedLimiter::new(
            WHOIS_LIMITER,
            settings.whois.rate,
            settings.whois.burst,
            store.clone(),
            settings.breaker,
        ));

        let mut tracker = JobTracker::new(store.clone(), settings.job_ttl);
        if let Some(archive) = archive {
            tracker = tracker.with_archive(archive);
        }
        let commit_log = CommitLogStore::new(store.clone(), settings.commit_log_ttl);

        Self {
            settings,
            store,
            dns,
            whois,
            tracker: Arc::new(tracker),
            commit_log: Arc::new(commit_log),
        }
    }

    /// Single-process context over an in-memory store, no archive.
    pub fn in_memory(settings: ScanSettings) -> Self {
        Self::new(settings, Arc::new(InMemoryKeyValueStore::new()), None)
    }

    /// Wire the context from the process environment.
    pub fn from_env() -> Result<Self, ContextError> {
        Self::from_settings(ScanSettings::from_env()?)
    }

    /// Redis when `redis_url` is set, Postgres archive when `database_url` is set.
    pub fn from_settings(settings: ScanSettings) -> Result<Self, ContextError> {
        let store = Self::connect_store(&settings)?;
        let archive = Self::connect_archive(&settings)?;
        Ok(Self::new(settings, store, archive))
    }

    fn connect_store(settings: &ScanSettings) -> Result<Arc<dyn KeyValueStore>, ContextError> {
        let Some(url) = settings.redis_url.as_deref() else {
            info!("no redis url configured, using in-memory store");
            return Ok(Arc::new(InMemoryKeyValueStore::new()));
        };

        #[cfg(feature = "redis")]
        {
            let store = crate::kv::RedisKeyValueStore::new(url)?;
            if !store.ping() {
                warn!("redis not reachable at startup, limiters start on their local buckets");
            }
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!(redis_url = %url, "redis url set but redis feature not enabled, falling back to in-memory store");
            Ok(Arc::new(InMemoryKeyValueStore::new()))
        }
    }

    fn connect_archive(
        settings: &ScanSettings,
    ) -> Result<Option<Arc<dyn JobArchive>>, ContextError> {
        let Some(url) = settings.database_url.as_deref() else {
            return Ok(None);
        };

        #[cfg(feature = "postgres")]
        {
            let archive = crate::jobs::PostgresJobArchive::connect(url)?;
            Ok(Some(Arc::new(archive)))
        }
        #[cfg(not(feature = "postgres"))]
        {
            let _ = url;
            warn!("database url set but postgres feature not enabled, job records are cache-only");
            Ok(None)
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn dns(&self) -> &Arc<DistributedLimiter> {
        &self.dns
    }

    pub fn whois(&self) -> &Arc<DistributedLimiter> {
        &self.whois
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn commit_log(&self) -> &Arc<CommitLogStore> {
        &self.commit_log
    }

    /// Orchestrator admitting items through this context's limiters.
    pub fn orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(
            self.tracker.clone(),
            self.commit_log.clone(),
            self.dns.clone(),
            self.whois.clone(),
            self.settings.orchestrator(),
        )
    }

    /// Executor over `queue`; processors still need registering.
    pub fn executor<Q: ScanQueue + 'static>(&self, queue: Q) -> BulkScanExecutor<Q> {
        BulkScanExecutor::new(self.tracker.clone(), self.orchestrator(), queue)
            .with_submit_chunk_size(self.settings.submit_chunk_size)
    }
}
