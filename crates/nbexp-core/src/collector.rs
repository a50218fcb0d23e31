//! Parallel collection cycle.
//!
//! One cycle runs two independent units concurrently:
//!
//! ```text
//!            ┌─ storage: cache hit? ──no──▶ StorageFetcher ─▶ cache.set ─┐
//! collect ───┤                                                           ├─▶ CollectionResult
//!            └─ jobs: JobsFetcher(now − scrape_window) ──────────────────┘
//! ```
//!
//! The units are joined, never try-joined: a failing unit contributes an
//! error for its own source and zero metrics, and the other unit's metrics
//! are still returned.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::client::ApiClient;
use crate::config::ConfigSnapshot;
use crate::error::FetchError;
use crate::fetcher::{JobMetrics, JobsFetcher, StorageFetcher, StorageMetrics};
use crate::instrument::Instrumentation;
use crate::model::{MetricValue, StorageKey};
use crate::version::ApiVersion;

/// Output of one cycle.
///
/// Each source carries its own error; an error on one side says nothing
/// about the other side's data.
#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub storage: Vec<MetricValue<StorageKey>>,
    pub jobs: JobMetrics,
    pub storage_error: Option<FetchError>,
    pub jobs_error: Option<FetchError>,
    /// Storage metrics were served from the cache.
    pub storage_from_cache: bool,
    pub collected_at: DateTime<Utc>,
}

impl CollectionResult {
    /// True if at least one source succeeded.
    pub fn is_up(&self) -> bool {
        self.storage_error.is_none() || self.jobs_error.is_none()
    }

    /// Raw job items folded into the job series.
    pub fn job_items(&self) -> usize {
        self.jobs.items
    }
}

/// Liveness and per-source freshness as of the last completed cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    /// At least one source succeeded in the last cycle.
    pub up: bool,
    /// `None` until the first cycle completes.
    pub last_cycle: Option<DateTime<Utc>>,
    pub last_storage_success: Option<DateTime<Utc>>,
    pub last_jobs_success: Option<DateTime<Utc>>,
    pub version: Option<ApiVersion>,
}

#[derive(Debug)]
struct Target<C> {
    client: Arc<C>,
    config: Arc<ConfigSnapshot>,
    /// Bumped by every `retarget`.
    generation: u64,
}

impl<C> Clone for Target<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            config: self.config.clone(),
            generation: self.generation,
        }
    }
}

/// Runs collection cycles against one API client.
#[derive(Debug)]
pub struct Collector<C: ApiClient> {
    target: RwLock<Target<C>>,
    cache: TtlCache<StorageMetrics>,
    storage: StorageFetcher,
    health: Mutex<HealthSnapshot>,
    instrumentation: Instrumentation,
}

impl<C: ApiClient> Collector<C> {
    pub fn new(client: Arc<C>, config: Arc<ConfigSnapshot>, instrumentation: Instrumentation) -> Self {
        let health = HealthSnapshot {
            version: config.api_version().cloned(),
            ..HealthSnapshot::default()
        };
        Self {
            cache: TtlCache::new(config.cache_ttl()),
            storage: StorageFetcher::new(instrumentation.clone()),
            target: RwLock::new(Target {
                client,
                config,
                generation: 0,
            }),
            health: Mutex::new(health),
            instrumentation,
        }
    }

    fn target(&self) -> Target<C> {
        self.target
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn client(&self) -> Arc<C> {
        self.target().client
    }

    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.target().config
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Switches to a new client and snapshot for subsequent cycles and
    /// returns the client it replaced.
    ///
    /// Cycles already running keep the target they started with, but their
    /// storage metrics are no longer cached. Cached storage metrics are
    /// dropped when the base URL changes; the cache TTL follows the new
    /// snapshot.
    pub fn retarget(&self, client: Arc<C>, config: Arc<ConfigSnapshot>) -> Arc<C> {
        let mut target = self.target.write().unwrap_or_else(|e| e.into_inner());
        if target.config.base_url() != config.base_url() {
            info!(
                from = %target.config.base_url(),
                to = %config.base_url(),
                "collection target changed, flushing cache"
            );
            self.cache.flush();
        }
        self.cache.set_ttl(config.cache_ttl());
        self.health.lock().unwrap_or_else(|e| e.into_inner()).version =
            config.api_version().cloned();

        let generation = target.generation + 1;
        let previous = std::mem::replace(
            &mut *target,
            Target {
                client,
                config,
                generation,
            },
        );
        previous.client
    }

    /// Caches storage metrics fetched under `generation`, unless the
    /// target has changed since.
    fn cache_storage(&self, generation: u64, fresh: &StorageMetrics) {
        let target = self.target.read().unwrap_or_else(|e| e.into_inner());
        if target.generation != generation {
            debug!(
                started = generation,
                current = target.generation,
                "target changed during cycle, storage metrics not cached"
            );
            return;
        }
        self.cache.set(fresh.clone());
    }

    /// Runs one cycle.
    ///
    /// If `cancel` fires, whatever finished is returned but neither the
    /// health snapshot nor the cache is touched.
    pub async fn collect(&self, cancel: &CancellationToken) -> CollectionResult {
        let Target {
            client,
            config,
            generation,
        } = self.target();
        let now = Utc::now();
        let window = TimeDelta::from_std(config.scrape_window()).unwrap_or(TimeDelta::MAX);
        let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let storage_unit = async {
            if let Some(hit) = self.cache.get() {
                debug!(units = hit.units, "storage metrics served from cache");
                return (Ok(hit), true);
            }
            (self.storage.fetch(cancel, client.as_ref()).await, false)
        };
        let jobs_unit = async {
            JobsFetcher::new(since, self.instrumentation.clone())
                .fetch(cancel, client.as_ref())
                .await
        };
        let ((storage, storage_from_cache), jobs) = tokio::join!(storage_unit, jobs_unit);

        let cancelled = cancel.is_cancelled();
        if !cancelled {
            if let (Ok(fresh), false) = (&storage, storage_from_cache) {
                self.cache_storage(generation, fresh);
            }
            let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
            health.up = storage.is_ok() || jobs.is_ok();
            health.last_cycle = Some(now);
            if storage.is_ok() {
                health.last_storage_success = Some(now);
            }
            if jobs.is_ok() {
                health.last_jobs_success = Some(now);
            }
        }

        let (storage, storage_error) = split("storage", storage);
        let (jobs, jobs_error) = split("jobs", jobs);

        let result = CollectionResult {
            storage: storage.map(|s| s.capacity).unwrap_or_default(),
            jobs: jobs.unwrap_or_default(),
            storage_error,
            jobs_error,
            storage_from_cache,
            collected_at: now,
        };
        if cancelled {
            info!("collection cycle cancelled");
        } else {
            info!(
                up = result.is_up(),
                storage_series = result.storage.len(),
                storage_from_cache,
                job_items = result.job_items(),
                "collection cycle finished"
            );
        }
        result
    }
}

fn split<T>(source: &'static str, result: Result<T, FetchError>) -> (Option<T>, Option<FetchError>) {
    match result {
        Ok(value) => (Some(value), None),
        Err(FetchError::Cancelled) => (None, Some(FetchError::Cancelled)),
        Err(e) => {
            warn!(source, error = %e, kind = ?e.kind(), "collection unit failed");
            (None, Some(e))
        }
    }
}
