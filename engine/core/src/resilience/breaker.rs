//! Per-Service Circuit Breaker
//!
//! Gates calls to a flaky downstream service and recovers without manual
//! intervention.
//!
//! ```text
//! +--------+  failure_threshold   +------+    open_timeout     +-----------+
//! | Closed | -------------------> | Open | ------------------> | Half-Open |
//! +--------+                      +------+                     +-----------+
//!     ^                               ^     probe failure            |
//!     |                               +------------------------------+
//!     |              probe success                                   |
//!     +--------------------------------------------------------------+
//! ```
//!
//! - **Closed**: calls flow, consecutive failures are counted
//! - **Open**: calls are denied until `open_timeout` has passed since the
//!   last failure
//! - **Half-Open**: exactly one probe call is admitted; its outcome decides
//!   whether the breaker closes or reopens
//!
//! All hot-path state lives in atomics. The bounded failure history sits
//! behind a `parking_lot` mutex and is only touched when a failure is
//! recorded or a snapshot is taken.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::BackendError;

/// Error type recorded when the caller did not classify the failure
pub const UNCLASSIFIED_ERROR: &str = "unclassified";

/// Failures kept per breaker for statistics
const HISTORY_LIMIT: usize = 100;

/// Window used to count "recent" failures in snapshots
const RECENT_WINDOW: Duration = Duration::from_secs(300);

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls allowed
    #[default]
    Closed,

    /// Tripped, calls rejected
    Open,

    /// Testing recovery with a single probe
    HalfOpen,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_OPEN => Self::Open,
            STATE_HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Thresholds for a single breaker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerParams {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,

    /// How long the breaker stays open after the last failure
    pub open_timeout_ms: u64,
}

impl BreakerParams {
    /// Create params from a threshold and an open duration
    ///
    /// Partial milliseconds round up so a short non-zero timeout never
    /// becomes zero.
    #[must_use]
    pub fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        let mut millis = open_timeout.as_millis();
        if open_timeout.subsec_nanos() % 1_000_000 != 0 {
            millis += 1;
        }
        Self {
            failure_threshold,
            open_timeout_ms: u64::try_from(millis).unwrap_or(u64::MAX),
        }
    }

    /// Open duration as a `Duration`
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 60_000,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// How alarming a service's recent failure volume is
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Two or fewer recent failures
    Low,
    /// More than two
    Medium,
    /// More than five
    High,
    /// More than ten
    Critical,
}

impl Severity {
    /// Classify a count of failures inside the recent window
    #[must_use]
    pub fn from_recent_failures(count: usize) -> Self {
        match count {
            c if c > 10 => Self::Critical,
            c if c > 5 => Self::High,
            c if c > 2 => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Operator advice for this severity
    #[must_use]
    pub fn recommendation(self) -> &'static str {
        match self {
            Self::Critical => "Disable the service temporarily and alert an operator",
            Self::High => "Increase retry delays and reduce load on the service",
            Self::Medium => "Monitor closely and prepare fallback strategies",
            Self::Low => "Continue normal operation with standard monitoring",
        }
    }
}

/// One recorded failure
#[derive(Clone, Debug, Serialize)]
pub struct FailureRecord {
    /// Wall-clock time of the failure
    pub at: DateTime<Utc>,

    /// Error class, e.g. `transient`, `timeout` or `panic`
    pub error_type: String,

    /// Error text reported by the caller
    pub reason: String,

    /// Monotonic offset from breaker creation, used for windowing
    #[serde(skip)]
    elapsed_ms: u64,
}

/// Point-in-time view of a breaker
#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    pub service_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls denied by `can_attempt`
    pub total_rejections: u64,
    /// Failures within the last five minutes
    pub recent_failures: usize,
    /// Lifetime failures over lifetime outcomes, as a percentage
    pub failure_rate_percent: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub severity: Severity,
    /// Distinct error types in the failure history, first seen first
    pub error_types: Vec<String>,
    /// Most frequent error type in the history; ties go to the earliest seen
    pub most_common_error: Option<String>,
    pub recommendation: &'static str,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Failure tracker and gate for one service
///
/// Obtain instances through [`BreakerRegistry`](super::BreakerRegistry) so that
/// every caller of a service shares the same breaker.
pub struct CircuitBreaker {
    /// Service identity
    service_id: String,

    params: BreakerParams,

    /// 0 = Closed, 1 = Open, 2 = `HalfOpen`
    state: AtomicU8,

    /// Consecutive failures since the last success
    failure_count: AtomicU32,

    /// Millis since `created` of the last failure, 0 = never
    last_failure_ms: AtomicU64,

    /// Millis since `created` of the last success, 0 = never
    last_success_ms: AtomicU64,

    /// Millis since `created` when the half-open probe was admitted, 0 = none
    probe_started_ms: AtomicU64,

    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,

    history: Mutex<VecDeque<FailureRecord>>,

    created: Instant,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(service_id: impl Into<String>, params: BreakerParams) -> Self {
        Self {
            service_id: service_id.into(),
            params,
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
            probe_started_ms: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            created: Instant::now(),
        }
    }

    /// Service this breaker protects
    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Configured thresholds
    #[must_use]
    pub fn params(&self) -> BreakerParams {
        self.params
    }

    /// Stored state; an elapsed `Open` only becomes `HalfOpen` on the next
    /// `can_attempt`
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failures since the last success
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Whether a half-open probe has been admitted and not yet resolved
    #[must_use]
    pub fn probe_in_flight(&self) -> bool {
        self.probe_started_ms.load(Ordering::Acquire) != 0
    }

    /// Ask to make a call
    ///
    /// Returns `true` in Closed, `false` in Open until the timeout passes, and
    /// `true` for exactly one caller once half-open. Admitting that caller
    /// marks the probe as in flight.
    pub fn can_attempt(&self) -> bool {
        let admitted = match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.open_elapsed() && self.enter_half_open(),
            CircuitState::HalfOpen => self.try_claim_probe(),
        };

        if !admitted {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Whether `can_attempt` would admit a call right now, without claiming
    /// the probe
    #[must_use]
    pub fn is_available(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.open_elapsed(),
            CircuitState::HalfOpen => {
                let started = self.probe_started_ms.load(Ordering::Acquire);
                started == 0 || self.probe_lease_expired(started)
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.last_success_ms.store(self.now_millis(), Ordering::Release);

        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => self.transition_to_closed(),
            CircuitState::Open => {
                // A call admitted before the trip finished late; the probe decides
            }
        }
    }

    /// Record a failed call with the error text that caused it
    pub fn record_failure(&self, reason: &str) {
        self.record_failure_as(UNCLASSIFIED_ERROR, reason);
    }

    /// Record a failed call reported as a backend error
    pub fn record_error(&self, error: &BackendError) {
        self.record_failure_as(error.kind(), &error.to_string());
    }

    /// Record a failed call with an explicit error type
    pub fn record_failure_as(&self, error_type: &str, reason: &str) {
        let now = self.now_millis();
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now, Ordering::Release);
        self.push_history(now, error_type, reason);

        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed => {
                if failures >= self.params.failure_threshold {
                    self.transition_to_open(STATE_CLOSED, failures);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open(STATE_HALF_OPEN, failures);
            }
            CircuitState::Open => {
                // Already open; the refreshed last_failure_ms extends the timer
            }
        }
    }

    /// Return to Closed with all counters and history cleared
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.last_failure_ms.store(0, Ordering::Release);
        self.last_success_ms.store(0, Ordering::Release);
        self.probe_started_ms.store(0, Ordering::Release);
        self.total_successes.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        self.total_rejections.store(0, Ordering::Relaxed);
        self.history.lock().clear();
        tracing::debug!(service = %self.service_id, "Circuit breaker reset");
    }

    /// Failures recorded so far, oldest first
    #[must_use]
    pub fn failure_history(&self) -> Vec<FailureRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Capture statistics for reporting
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.now_millis();
        let window_ms = u64::try_from(RECENT_WINDOW.as_millis()).unwrap_or(u64::MAX);
        let (recent_failures, type_counts) = {
            let history = self.history.lock();
            let recent = history
                .iter()
                .filter(|record| now.saturating_sub(record.elapsed_ms) < window_ms)
                .count();
            let mut counts: Vec<(String, usize)> = Vec::new();
            for record in history.iter() {
                match counts.iter_mut().find(|(kind, _)| *kind == record.error_type) {
                    Some((_, count)) => *count += 1,
                    None => counts.push((record.error_type.clone(), 1)),
                }
            }
            (recent, counts)
        };
        let most_common_error = type_counts
            .iter()
            .fold(None::<&(String, usize)>, |best, entry| match best {
                Some(current) if current.1 >= entry.1 => Some(current),
                _ => Some(entry),
            })
            .map(|(kind, _)| kind.clone());
        let severity = Severity::from_recent_failures(recent_failures);

        let successes = self.total_successes.load(Ordering::Relaxed);
        let failures = self.total_failures.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let failure_rate_percent = if successes + failures == 0 {
            0.0
        } else {
            failures as f64 / (successes + failures) as f64 * 100.0
        };

        BreakerSnapshot {
            service_id: self.service_id.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            failure_threshold: self.params.failure_threshold,
            open_timeout_ms: self.params.open_timeout_ms,
            total_successes: successes,
            total_failures: failures,
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            recent_failures,
            failure_rate_percent,
            last_failure_at: self.wall_clock(self.last_failure_ms.load(Ordering::Acquire)),
            last_success_at: self.wall_clock(self.last_success_ms.load(Ordering::Acquire)),
            severity,
            error_types: type_counts.into_iter().map(|(kind, _)| kind).collect(),
            most_common_error,
            recommendation: severity.recommendation(),
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn open_elapsed(&self) -> bool {
        let last_failure = self.last_failure_ms.load(Ordering::Acquire);
        self.now_millis().saturating_sub(last_failure) >= self.params.open_timeout_ms
    }

    /// Move Open -> `HalfOpen` (whoever wins the swap logs it), then compete
    /// for the probe slot
    fn enter_half_open(&self) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_HALF_OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            tracing::info!(service = %self.service_id, "Circuit breaker transitioning to half-open");
        }
        self.try_claim_probe()
    }

    fn try_claim_probe(&self) -> bool {
        let now = self.now_millis();
        match self
            .probe_started_ms
            .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(started) => {
                // The probe's task may have been cancelled before reporting
                if self.probe_lease_expired(started)
                    && self
                        .probe_started_ms
                        .compare_exchange(started, now, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    tracing::warn!(
                        service = %self.service_id,
                        "Half-open probe never reported, admitting a new probe"
                    );
                    return true;
                }
                false
            }
        }
    }

    fn probe_lease_expired(&self, started: u64) -> bool {
        self.now_millis().saturating_sub(started) >= self.params.open_timeout_ms
    }

    fn transition_to_closed(&self) {
        if self
            .state
            .compare_exchange(
                STATE_HALF_OPEN,
                STATE_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.failure_count.store(0, Ordering::Release);
            self.probe_started_ms.store(0, Ordering::Release);
            tracing::info!(service = %self.service_id, "Circuit breaker closed - service recovered");
        }
    }

    fn transition_to_open(&self, from: u8, failures: u32) {
        if self
            .state
            .compare_exchange(from, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.probe_started_ms.store(0, Ordering::Release);
            tracing::warn!(
                service = %self.service_id,
                consecutive_failures = failures,
                open_timeout_ms = self.params.open_timeout_ms,
                "Circuit breaker opened"
            );
        }
    }

    fn push_history(&self, now: u64, error_type: &str, reason: &str) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(FailureRecord {
            at: Utc::now(),
            error_type: error_type.to_string(),
            reason: reason.to_string(),
            elapsed_ms: now,
        });
    }

    /// Millis since creation, offset by one so that 0 can mean "unset"
    fn now_millis(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis())
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1)
    }

    fn wall_clock(&self, stamp: u64) -> Option<DateTime<Utc>> {
        if stamp == 0 {
            return None;
        }
        let ago = self.now_millis().saturating_sub(stamp);
        let ago = chrono::Duration::milliseconds(i64::try_from(ago).unwrap_or(i64::MAX));
        Some(Utc::now() - ago)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("probe_in_flight", &self.probe_in_flight())
            .finish_non_exhaustive()
    }
}
