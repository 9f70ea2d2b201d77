//! Resilience Integration Tests
//!
//! End-to-end behavior of the engine through its public API:
//! - Breaker thresholds, single half-open probe, probe outcomes
//! - Retry backoff timing against a breaker
//! - Fallback chains ending in the terminal responder
//! - Fan-out collection under a deadline, cache hits
//! - Routing a query through a profile loaded from disk
//!
//! Timing-sensitive tests run on tokio's paused clock, so they are fast and
//! deterministic.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use iris_engine::{
    Answer, AnswerBackend, AnswerRequest, BackendDescriptor, BackendError, BreakerParams,
    BreakerRegistry, CallFailure, CircuitBreaker, CircuitState, EngineConfig, FallbackChain,
    FallbackExecutor, FetchRequest, FetchStatus, LocalResponder, ParallelCollector,
    RequestRouter, RetryPolicy, ServedBy, SourceBackend, TtlCache, LOCAL_BACKEND_ID,
};

// =============================================================================
// Test Backends
// =============================================================================

/// Answer backend that always fails the same way
struct BrokenProvider {
    id: &'static str,
    error: BackendError,
    calls: AtomicUsize,
}

impl BrokenProvider {
    fn new(id: &'static str, error: BackendError) -> Arc<Self> {
        Arc::new(Self {
            id,
            error,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AnswerBackend for BrokenProvider {
    fn id(&self) -> &str {
        self.id
    }

    async fn generate(&self, _request: &AnswerRequest) -> Result<Answer, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Answer backend that echoes the context it was given
struct EchoProvider;

#[async_trait]
impl AnswerBackend for EchoProvider {
    fn id(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: &AnswerRequest) -> Result<Answer, BackendError> {
        Ok(Answer::new(request.context.clone().unwrap_or_default()))
    }
}

/// Source that answers after a delay, or fails immediately
struct TimedSource {
    id: &'static str,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl TimedSource {
    fn new(id: &'static str, delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            delay,
            fail,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SourceBackend for TimedSource {
    fn id(&self) -> &str {
        self.id
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<Value, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BackendError::permanent("bad request"));
        }
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "summary": format!("data from {}", self.id) }))
    }
}

fn fallible(backend: Arc<dyn AnswerBackend>, priority: u32) -> BackendDescriptor {
    BackendDescriptor::new(backend, priority)
}

fn local_terminal(priority: u32) -> BackendDescriptor {
    BackendDescriptor::terminal(Arc::new(LocalResponder::new()), priority)
}

// =============================================================================
// Circuit Breaker
// =============================================================================

#[tokio::test(start_paused = true)]
async fn breaker_opens_at_threshold_and_admits_one_probe() {
    let breaker = CircuitBreaker::new("omx", BreakerParams::new(3, Duration::from_secs(60)));

    for _ in 0..3 {
        assert!(breaker.can_attempt());
        breaker.record_failure("503");
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.can_attempt());

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(!breaker.can_attempt());

    tokio::time::advance(Duration::from_secs(2)).await;
    let admitted = (0..8).filter(|_| breaker.can_attempt()).count();
    assert_eq!(admitted, 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert!(breaker.can_attempt());
}

#[tokio::test(start_paused = true)]
async fn failed_probe_restarts_the_open_timer() {
    let breaker = CircuitBreaker::new("smhi", BreakerParams::new(1, Duration::from_secs(10)));
    breaker.record_failure("down");

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(breaker.can_attempt());
    breaker.record_failure("still down");
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(!breaker.can_attempt());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(breaker.can_attempt());
}

// =============================================================================
// Retry Policy
// =============================================================================

#[tokio::test(start_paused = true)]
async fn retry_backs_off_one_then_two_seconds() {
    let breaker = CircuitBreaker::new("groq", BreakerParams::new(10, Duration::from_secs(60)));
    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_backoff(Duration::from_secs(1), 2.0)
        .with_jitter(0.1);

    let started = Instant::now();
    let attempt_times = Mutex::new(Vec::new());
    let outcome: Result<(), CallFailure> = policy
        .execute(&breaker, None, |_| {
            attempt_times.lock().push(started.elapsed());
            async { Err(BackendError::transient("429")) }
        })
        .await;

    let times = attempt_times.into_inner();
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(
        first_gap >= Duration::from_millis(900) && first_gap <= Duration::from_millis(1100),
        "{first_gap:?}"
    );
    assert!(
        second_gap >= Duration::from_millis(1800) && second_gap <= Duration::from_millis(2200),
        "{second_gap:?}"
    );

    assert!(matches!(
        outcome,
        Err(CallFailure::Transient { attempts: 3, .. })
    ));
    assert_eq!(breaker.failure_count(), 3);
}

// =============================================================================
// Fallback Chain
// =============================================================================

#[tokio::test]
async fn chain_is_served_by_terminal_after_failures() {
    let a = BrokenProvider::new("a", BackendError::transient("timeout"));
    let b = BrokenProvider::new("b", BackendError::permanent("bad request"));
    let chain = FallbackChain::new(vec![
        fallible(a.clone(), 0),
        fallible(b.clone(), 1),
        local_terminal(2),
    ])
    .unwrap();

    let registry = Arc::new(BreakerRegistry::default());
    let executor = FallbackExecutor::new(Arc::clone(&registry), RetryPolicy::no_retry());
    let result = executor
        .execute(&chain, &AnswerRequest::new("what is the GDP"))
        .await;

    assert_eq!(result.backend_id, LOCAL_BACKEND_ID);
    assert_eq!(result.served_by, ServedBy::TerminalFallback);
    assert!(result.is_degraded());
    assert_eq!(registry.get("a").unwrap().failure_count(), 1);
    assert_eq!(registry.get("b").unwrap().failure_count(), 1);
    assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    assert_eq!(b.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn chain_never_fails_with_many_broken_backends() {
    let mut descriptors: Vec<BackendDescriptor> = ["p0", "p1", "p2", "p3", "p4", "p5"]
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let priority = u32::try_from(i).unwrap();
            fallible(BrokenProvider::new(*id, BackendError::permanent("gone")), priority)
        })
        .collect();
    descriptors.push(local_terminal(100));
    let chain = FallbackChain::new(descriptors).unwrap();

    let executor =
        FallbackExecutor::new(Arc::new(BreakerRegistry::default()), RetryPolicy::no_retry());
    for _ in 0..3 {
        let result = executor.execute(&chain, &AnswerRequest::new("q")).await;
        assert_eq!(result.served_by, ServedBy::TerminalFallback);
        assert_eq!(result.attempts.len(), 6);
    }
}

// =============================================================================
// Parallel Collection
// =============================================================================

fn collector(max_concurrent: usize) -> ParallelCollector {
    ParallelCollector::new(
        Arc::new(BreakerRegistry::default()),
        Arc::new(TtlCache::new(Duration::from_secs(3600))),
        RetryPolicy::no_retry(),
        max_concurrent,
    )
}

#[tokio::test(start_paused = true)]
async fn collection_completes_at_deadline_with_every_key() {
    let mut collector = collector(8);
    collector.register_source(
        TimedSource::new("x", Duration::from_millis(50), false),
        Duration::from_secs(60),
        None,
    );
    collector.register_source(
        TimedSource::new("y", Duration::from_secs(3600), false),
        Duration::from_secs(60),
        None,
    );
    collector.register_source(
        TimedSource::new("z", Duration::ZERO, true),
        Duration::from_secs(60),
        None,
    );

    let sources: Vec<String> = vec!["x".into(), "y".into(), "z".into()];
    let started = Instant::now();
    let report = collector
        .collect(&sources, &FetchRequest::new("q"), Duration::from_millis(200))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(report.len(), 3);
    assert_eq!(report.get("x").unwrap().status, FetchStatus::Ok);
    assert!(matches!(
        report.get("y").unwrap().error,
        Some(CallFailure::Timeout { .. })
    ));
    assert_eq!(report.get("z").unwrap().status, FetchStatus::Failed);
    assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn repeated_collection_hits_the_cache() {
    let source = TimedSource::new("scb", Duration::from_millis(5), false);
    let mut collector = collector(2);
    collector.register_source(source.clone(), Duration::from_secs(600), None);

    let sources = vec!["scb".to_string()];
    let request = FetchRequest::new("population").with_param("region", "SE");
    collector.collect(&sources, &request, Duration::from_secs(1)).await;
    let report = collector.collect(&sources, &request, Duration::from_secs(1)).await;

    let result = report.get("scb").unwrap();
    assert!(result.served_from_cache);
    assert_eq!(result.status, FetchStatus::Ok);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(collector.cache().stats().hits, 1);
}

// =============================================================================
// Routing
// =============================================================================

const ROUTER_CONFIG: &str = r#"
collection_timeout_ms = 500

[retry]
max_attempts = 1

[breakers.flaky]
failure_threshold = 1
open_timeout_ms = 60000

[profiles.smart]
sources = ["scb", "news"]
temperature = 0.5
chain = [
  { backend_id = "flaky", priority = 0 },
  { backend_id = "echo", priority = 1 },
  { backend_id = "local", priority = 2 },
]
"#;

#[tokio::test]
async fn route_profile_loaded_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(ROUTER_CONFIG.as_bytes()).unwrap();
    let config = Arc::new(EngineConfig::load(file.path()).await.unwrap());

    let flaky = BrokenProvider::new("flaky", BackendError::transient("503"));
    let mut router = RequestRouter::new(config);
    router.register_answer_backend(flaky.clone(), None);
    router.register_answer_backend(Arc::new(EchoProvider), None);
    router.register_source(TimedSource::new("scb", Duration::ZERO, false), None);
    router.register_source(TimedSource::new("news", Duration::ZERO, true), None);

    let first = router.route_profile("smart", "population").await.unwrap();
    assert_eq!(first.analysis.backend_id, "echo");
    assert_eq!(first.analysis.served_by, ServedBy::Fallback);
    assert_eq!(first.analysis.text, "\n=== SCB ===\ndata from scb");
    assert_eq!(first.sources.failed_count(), 1);

    // flaky's breaker opened after one failure, so it is not called again
    let second = router.route_profile("smart", "population").await.unwrap();
    assert_eq!(second.analysis.backend_id, "echo");
    assert!(second.analysis.attempts[0].circuit_open);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    assert!(second.sources.get("scb").unwrap().served_from_cache);
    assert_eq!(router.registry().open_services(), vec!["flaky"]);
    assert_eq!(router.registry().get("news").unwrap().failure_count(), 2);
}
