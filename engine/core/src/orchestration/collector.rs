//! Parallel Data Collector
//!
//! Fans one request out to many independent sources and always hands back a
//! complete per-source result map.
//!
//! ```text
//!                      ┌─ cache hit ─────────────────────────► Ok (cached)
//!   collect(sources) ──┼─ breaker unavailable ───────────────► Failed(CircuitOpen)
//!                      └─ spawn ─► permit ─► RetryPolicy ─┬──► Ok (cache insert)
//!                                                         ├──► Degraded (stale cache)
//!                                                         └──► Failed
//!   deadline elapsed ─► abort pending tasks ─────────────────► Failed(Timeout)
//! ```
//!
//! Fetches run as tokio tasks in a `JoinSet`; a semaphore bounds how many are
//! in flight at once. When the caller's deadline passes the remaining tasks
//! are aborted so their connections are released.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::cache::{CacheKey, TtlCache};
use crate::backend::{FetchRequest, SourceBackend};
use crate::error::{BackendError, CallFailure};
use crate::resilience::{BreakerRegistry, CircuitBreaker, RetryPolicy};

// ============================================================================
// Results
// ============================================================================

/// Outcome class of one source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// Fresh data (from the source or an unexpired cache entry)
    Ok,
    /// The source failed; an older cached value is served instead
    Degraded,
    /// Nothing usable
    Failed,
}

/// Result for one source in one collection
#[derive(Clone, Debug, Serialize)]
pub struct FetchResult {
    pub source_id: String,
    pub status: FetchStatus,
    /// Present iff `Ok` or `Degraded`
    pub payload: Option<Value>,
    /// Present iff `Failed` or `Degraded`
    #[serde(serialize_with = "serialize_failure")]
    pub error: Option<CallFailure>,
    pub served_from_cache: bool,
    pub fetched_at: DateTime<Utc>,
}

fn serialize_failure<S: Serializer>(
    failure: &Option<CallFailure>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match failure {
        Some(failure) => serializer.serialize_some(&failure.to_string()),
        None => serializer.serialize_none(),
    }
}

impl FetchResult {
    /// Fresh payload
    pub fn ok(source_id: impl Into<String>, payload: Value, served_from_cache: bool) -> Self {
        Self {
            source_id: source_id.into(),
            status: FetchStatus::Ok,
            payload: Some(payload),
            error: None,
            served_from_cache,
            fetched_at: Utc::now(),
        }
    }

    /// Stale payload standing in for a failed fetch
    pub fn degraded(source_id: impl Into<String>, payload: Value, error: CallFailure) -> Self {
        Self {
            source_id: source_id.into(),
            status: FetchStatus::Degraded,
            payload: Some(payload),
            error: Some(error),
            served_from_cache: true,
            fetched_at: Utc::now(),
        }
    }

    /// No payload
    pub fn failed(source_id: impl Into<String>, error: CallFailure) -> Self {
        Self {
            source_id: source_id.into(),
            status: FetchStatus::Failed,
            payload: None,
            error: Some(error),
            served_from_cache: false,
            fetched_at: Utc::now(),
        }
    }

    /// Whether the payload can be used (Ok or Degraded)
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.payload.is_some()
    }
}

/// Complete per-source outcome of one `collect` call
#[derive(Clone, Debug, Serialize)]
pub struct CollectionReport {
    results: HashMap<String, FetchResult>,
    /// Requested source ids, deduplicated, in request order
    order: Vec<String>,
    elapsed_ms: u64,
}

impl CollectionReport {
    /// Result for a source
    #[must_use]
    pub fn get(&self, source_id: &str) -> Option<&FetchResult> {
        self.results.get(source_id)
    }

    /// Results in request order
    pub fn iter(&self) -> impl Iterator<Item = &FetchResult> {
        self.order.iter().filter_map(|id| self.results.get(id))
    }

    /// Requested source ids in request order
    #[must_use]
    pub fn source_ids(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Every requested source has a result
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.order.iter().all(|id| self.results.contains_key(id))
    }

    #[must_use]
    pub fn ok_count(&self) -> usize {
        self.count(FetchStatus::Ok)
    }

    #[must_use]
    pub fn degraded_count(&self) -> usize {
        self.count(FetchStatus::Degraded)
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.count(FetchStatus::Failed)
    }

    /// Wall time of the collection
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Take the underlying map
    #[must_use]
    pub fn into_map(self) -> HashMap<String, FetchResult> {
        self.results
    }

    fn count(&self, status: FetchStatus) -> usize {
        self.results.values().filter(|r| r.status == status).count()
    }
}

// ============================================================================
// Collector
// ============================================================================

#[derive(Clone)]
struct RegisteredSource {
    backend: Arc<dyn SourceBackend>,
    ttl: Duration,
    call_timeout: Option<Duration>,
}

/// Concurrent, cache-first fetcher over registered sources
pub struct ParallelCollector {
    sources: HashMap<String, RegisteredSource>,
    registry: Arc<BreakerRegistry>,
    cache: Arc<TtlCache<Value>>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ParallelCollector {
    /// Create a collector allowing `max_concurrent` fetches in flight
    pub fn new(
        registry: Arc<BreakerRegistry>,
        cache: Arc<TtlCache<Value>>,
        retry: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            sources: HashMap::new(),
            registry,
            cache,
            retry,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Register a source with its cache TTL and optional per-call timeout
    pub fn register_source(
        &mut self,
        backend: Arc<dyn SourceBackend>,
        ttl: Duration,
        call_timeout: Option<Duration>,
    ) {
        let id = backend.id().to_string();
        tracing::debug!(source = %id, ttl_secs = ttl.as_secs(), "Registering data source");
        self.sources.insert(
            id,
            RegisteredSource {
                backend,
                ttl,
                call_timeout,
            },
        );
    }

    /// Whether a source id is registered
    #[must_use]
    pub fn has_source(&self, source_id: &str) -> bool {
        self.sources.contains_key(source_id)
    }

    /// Registered source ids, sorted
    #[must_use]
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Shared cache
    #[must_use]
    pub fn cache(&self) -> &Arc<TtlCache<Value>> {
        &self.cache
    }

    /// Maximum fetches in flight
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Fetch every source in `sources` concurrently, returning within `deadline`
    pub async fn collect(
        &self,
        sources: &[String],
        request: &FetchRequest,
        deadline: Duration,
    ) -> CollectionReport {
        let started = Instant::now();
        let deadline_at = started + deadline;
        let fingerprint = request.fingerprint();

        let mut seen = HashSet::new();
        let order: Vec<String> = sources
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let mut results = HashMap::with_capacity(order.len());
        let mut tasks = JoinSet::new();

        for source_id in &order {
            let Some(source) = self.sources.get(source_id) else {
                tracing::warn!(source = %source_id, "Unknown data source requested");
                results.insert(
                    source_id.clone(),
                    FetchResult::failed(
                        source_id.as_str(),
                        CallFailure::Permanent {
                            attempts: 0,
                            last: BackendError::permanent("source is not registered"),
                        },
                    ),
                );
                continue;
            };

            let key = CacheKey::new(source_id.as_str(), fingerprint);
            if let Some(payload) = self.cache.get_fresh(&key) {
                tracing::debug!(source = %source_id, "Serving source from cache");
                results.insert(
                    source_id.clone(),
                    FetchResult::ok(source_id.as_str(), payload, true),
                );
                continue;
            }

            let breaker = self.registry.get_or_create(source_id);
            if !breaker.is_available() {
                tracing::debug!(source = %source_id, "Skipping source with open circuit");
                results.insert(
                    source_id.clone(),
                    FetchResult::failed(
                        source_id.as_str(),
                        CallFailure::CircuitOpen {
                            service_id: source_id.clone(),
                        },
                    ),
                );
                continue;
            }

            let job = SourceJob {
                source_id: source_id.clone(),
                source: source.clone(),
                key,
                breaker,
                cache: Arc::clone(&self.cache),
                retry: self.retry.clone(),
                semaphore: Arc::clone(&self.semaphore),
                request: request.clone(),
            };
            tasks.spawn(job.run_guarded());
        }

        loop {
            match tokio::time::timeout_at(deadline_at, tasks.join_next()).await {
                Ok(Some(Ok(result))) => {
                    results.insert(result.source_id.clone(), result);
                }
                Ok(Some(Err(join_error))) => {
                    tracing::error!(error = %join_error, "Source task ended without a result");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        pending = tasks.len(),
                        deadline_ms = deadline.as_millis() as u64,
                        "Collection deadline reached, cancelling pending fetches"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        for source_id in &order {
            results.entry(source_id.clone()).or_insert_with(|| {
                FetchResult::failed(source_id.as_str(), CallFailure::Timeout { after: deadline })
            });
        }

        CollectionReport {
            results,
            order,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl std::fmt::Debug for ParallelCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelCollector")
            .field("sources", &self.source_ids())
            .field("max_concurrent", &self.max_concurrent)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Everything one spawned fetch needs, owned
struct SourceJob {
    source_id: String,
    source: RegisteredSource,
    key: CacheKey,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<TtlCache<Value>>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    request: FetchRequest,
}

impl SourceJob {
    /// Run the job, turning a panicking backend into a failed result
    async fn run_guarded(self) -> FetchResult {
        let source_id = self.source_id.clone();
        match AssertUnwindSafe(self.run()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(source = %source_id, "Source fetch panicked");
                FetchResult::failed(
                    source_id,
                    CallFailure::Permanent {
                        attempts: 1,
                        last: BackendError::permanent("source fetch panicked"),
                    },
                )
            }
        }
    }

    async fn run(self) -> FetchResult {
        let Ok(_permit) = self.semaphore.acquire_owned().await else {
            return FetchResult::failed(
                self.source_id,
                CallFailure::Permanent {
                    attempts: 0,
                    last: BackendError::permanent("collector is shutting down"),
                },
            );
        };

        let backend = &self.source.backend;
        let request = &self.request;
        let outcome = self
            .retry
            .execute(&self.breaker, self.source.call_timeout, |_| backend.fetch(request))
            .await;

        match outcome {
            Ok(payload) => {
                self.cache
                    .insert(self.key, payload.clone(), self.source.ttl);
                FetchResult::ok(self.source_id, payload, false)
            }
            Err(failure) if failure.is_circuit_open() => {
                // Another caller claimed the half-open probe after the gate
                tracing::debug!(source = %self.source_id, "Circuit opened before fetch started");
                FetchResult::failed(self.source_id, failure)
            }
            Err(failure) => {
                tracing::warn!(source = %self.source_id, error = %failure, "Source fetch failed");
                match self.cache.get_stale(&self.key) {
                    Some(stale) => {
                        tracing::info!(
                            source = %self.source_id,
                            age_secs = stale.age.as_secs(),
                            "Serving stale cached data for failed source"
                        );
                        FetchResult::degraded(self.source_id, stale.value, failure)
                    }
                    None => FetchResult::failed(self.source_id, failure),
                }
            }
        }
    }
}
