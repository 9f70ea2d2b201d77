//! Fallback Chain Execution
//!
//! Tries the backends of a chain one after another until one answers.
//!
//! ```text
//!   primary ──fail──► fallback 1 ──fail──► ... ──fail──► terminal (ungated)
//!      │                  │                                  │
//!      ▼                  ▼                                  ▼
//!   Primary            Fallback                     TerminalFallback
//!                                                            │ error / panic
//!                                                            ▼
//!                                                        SafetyNet
//! ```
//!
//! Every non-terminal call runs through the retry policy and that backend's
//! own circuit breaker. Attempts are strictly sequential. The terminal
//! fallback is called directly; it is infallible by contract, and a
//! violation of that contract is either surfaced
//! ([`FallbackExecutor::execute_strict`]) or absorbed into a static degraded
//! answer ([`FallbackExecutor::execute`]).

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use uuid::Uuid;

use crate::backend::{Answer, AnswerRequest, BackendDescriptor};
use crate::error::{BackendError, CallFailure, ChainError, EngineError};
use crate::resilience::{BreakerRegistry, RetryPolicy};

/// Backend id reported when the safety net answers
pub const SAFETY_NET_ID: &str = "safety-net";

// ============================================================================
// Fallback Chain
// ============================================================================

/// Validated, priority-ordered list of answer backends
///
/// Exactly one member is the terminal fallback and it is always last.
#[derive(Clone, Debug)]
pub struct FallbackChain {
    backends: Vec<BackendDescriptor>,
}

impl FallbackChain {
    /// Sort by priority (stable) and validate the shape
    pub fn new(mut backends: Vec<BackendDescriptor>) -> Result<Self, ChainError> {
        backends.sort_by_key(|b| b.priority);
        Self::validate(&backends)?;
        Ok(Self { backends })
    }

    fn validate(backends: &[BackendDescriptor]) -> Result<(), ChainError> {
        let Some(last) = backends.last() else {
            return Err(ChainError::Empty);
        };

        let mut seen = HashSet::new();
        for backend in backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(ChainError::DuplicateBackend(backend.id.clone()));
            }
        }

        let terminals: Vec<&BackendDescriptor> =
            backends.iter().filter(|b| b.is_terminal_fallback).collect();
        match terminals.as_slice() {
            [] => Err(ChainError::MissingTerminal),
            [terminal] if !last.is_terminal_fallback => {
                Err(ChainError::TerminalNotLast(terminal.id.clone()))
            }
            [_] => Ok(()),
            many => Err(ChainError::MultipleTerminals(many.len())),
        }
    }

    /// First backend tried
    #[must_use]
    pub fn primary(&self) -> &BackendDescriptor {
        &self.backends[0]
    }

    /// The terminal fallback
    #[must_use]
    pub fn terminal(&self) -> &BackendDescriptor {
        &self.backends[self.backends.len() - 1]
    }

    /// Backends gated by breaker and retry, in order
    #[must_use]
    pub fn fallible(&self) -> &[BackendDescriptor] {
        &self.backends[..self.backends.len() - 1]
    }

    /// All backends in order
    #[must_use]
    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    /// Backend ids in order
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.id.as_str()).collect()
    }

    #[must_use]
    pub fn contains(&self, backend_id: &str) -> bool {
        self.backends.iter().any(|b| b.id == backend_id)
    }

    /// Number of backends including the terminal
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false for a validated chain
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Which tier of the chain produced the answer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedBy {
    /// First backend of the chain
    Primary,
    /// A later, non-terminal backend
    Fallback,
    /// The terminal fallback after every other backend failed
    TerminalFallback,
    /// Static response after the terminal fallback broke its contract
    SafetyNet,
}

/// A chain member that did not serve the request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub backend_id: String,
    pub error: String,
    /// The breaker denied the call; nothing was sent
    pub circuit_open: bool,
}

impl AttemptRecord {
    fn from_failure(backend_id: &str, failure: &CallFailure) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            error: failure.to_string(),
            circuit_open: failure.is_circuit_open(),
        }
    }
}

/// Answer of a chain execution, tagged with who served it
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisResult {
    pub request_id: Uuid,
    pub text: String,
    /// Id of the backend that produced `text`
    pub backend_id: String,
    pub served_by: ServedBy,
    pub model: Option<String>,
    pub tokens_used: Option<u32>,
    /// Backends tried before the serving one, in order
    pub attempts: Vec<AttemptRecord>,
}

impl AnalysisResult {
    fn from_answer(
        request: &AnswerRequest,
        backend_id: &str,
        served_by: ServedBy,
        answer: Answer,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            request_id: request.request_id,
            text: answer.text,
            backend_id: backend_id.to_string(),
            served_by,
            model: answer.model,
            tokens_used: answer.tokens_used,
            attempts,
        }
    }

    /// Static answer used when even the terminal fallback failed
    ///
    /// The text points at a direct source for the topic the query asks about.
    #[must_use]
    pub fn safety_net(request: &AnswerRequest, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            request_id: request.request_id,
            text: QueryIntent::classify(&request.query).safety_net_text(&request.query),
            backend_id: SAFETY_NET_ID.to_string(),
            served_by: ServedBy::SafetyNet,
            model: None,
            tokens_used: Some(0),
            attempts,
        }
    }

    /// Served by anything other than the primary backend
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.served_by != ServedBy::Primary
    }
}

/// Coarse topic of a query, from keywords in English or Swedish
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryIntent {
    Weather,
    Market,
    News,
    Statistics,
    General,
}

impl QueryIntent {
    const WEATHER: &'static [&'static str] = &[
        "weather", "temperature", "rain", "sun", "forecast", "väder", "temperatur", "regn", "sol",
    ];
    const MARKET: &'static [&'static str] = &[
        "stock", "stocks", "shares", "market", "omx", "aktie", "aktier", "börsen", "kurs",
    ];
    const NEWS: &'static [&'static str] = &["news", "headlines", "nyheter", "nyhet", "aktuellt"];
    const STATISTICS: &'static [&'static str] = &[
        "statistics", "scb", "population", "figures", "statistik", "befolkning", "siffror",
    ];

    /// First matching topic in the order weather, market, news, statistics
    #[must_use]
    pub fn classify(query: &str) -> Self {
        let lowered = query.to_lowercase();
        let words: HashSet<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let mentions = |keywords: &[&str]| keywords.iter().any(|k| words.contains(k));

        if mentions(Self::WEATHER) {
            Self::Weather
        } else if mentions(Self::MARKET) {
            Self::Market
        } else if mentions(Self::NEWS) {
            Self::News
        } else if mentions(Self::STATISTICS) {
            Self::Statistics
        } else {
            Self::General
        }
    }

    fn safety_net_text(self, query: &str) -> String {
        match self {
            Self::Weather => "Weather information is temporarily unavailable. \
                              Check SMHI.se directly or try again later."
                .to_string(),
            Self::Market => "Financial information is temporarily unavailable. \
                             Check Avanza, Nordnet or Nasdaq Stockholm directly."
                .to_string(),
            Self::News => "News updates are temporarily unavailable. \
                           Visit SVT.se, DN.se or Aftonbladet.se for the latest news."
                .to_string(),
            Self::Statistics => "Statistics from SCB are temporarily unavailable. \
                                 Visit SCB.se directly for official Swedish statistics."
                .to_string(),
            Self::General => format!(
                "Could not answer '{query}' because all answer providers are temporarily \
                 unavailable. Please try again later."
            ),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Temperature used by non-primary backends
#[must_use]
pub fn fallback_temperature(temperature: f32) -> f32 {
    if temperature > 0.0 {
        (temperature * 0.8).max(0.1)
    } else {
        0.5
    }
}

/// Runs fallback chains against a shared breaker registry
#[derive(Debug)]
pub struct FallbackExecutor {
    registry: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    adjust_fallback_temperature: bool,
}

impl FallbackExecutor {
    pub fn new(registry: Arc<BreakerRegistry>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            retry,
            adjust_fallback_temperature: true,
        }
    }

    /// Whether non-primary backends get a damped temperature (default on)
    #[must_use]
    pub fn with_temperature_adjustment(mut self, enabled: bool) -> Self {
        self.adjust_fallback_temperature = enabled;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    /// Execute the chain; never fails
    ///
    /// A terminal-fallback contract violation is logged and replaced with
    /// [`AnalysisResult::safety_net`].
    pub async fn execute(&self, chain: &FallbackChain, request: &AnswerRequest) -> AnalysisResult {
        let mut attempts = Vec::new();
        if let Some(result) = self.run_fallible(chain, request, &mut attempts).await {
            return result;
        }

        match self.run_terminal(chain, request, &mut attempts).await {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(
                    request_id = %request.request_id,
                    error = %error,
                    "Terminal fallback failed, answering from safety net"
                );
                attempts.push(AttemptRecord {
                    backend_id: chain.terminal().id.clone(),
                    error: error.to_string(),
                    circuit_open: false,
                });
                AnalysisResult::safety_net(request, attempts)
            }
        }
    }

    /// Execute the chain, surfacing a terminal-fallback contract violation
    pub async fn execute_strict(
        &self,
        chain: &FallbackChain,
        request: &AnswerRequest,
    ) -> Result<AnalysisResult, EngineError> {
        let mut attempts = Vec::new();
        if let Some(result) = self.run_fallible(chain, request, &mut attempts).await {
            return Ok(result);
        }
        self.run_terminal(chain, request, &mut attempts).await
    }

    /// Try every non-terminal backend in order; `None` when all failed
    async fn run_fallible(
        &self,
        chain: &FallbackChain,
        request: &AnswerRequest,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Option<AnalysisResult> {
        tracing::debug!(
            request_id = %request.request_id,
            chain = ?chain.ids(),
            "Executing fallback chain"
        );

        for (position, descriptor) in chain.fallible().iter().enumerate() {
            let call_request = self.request_for(request, position);
            let breaker = self.registry.get_or_create(&descriptor.id);
            let backend = &descriptor.backend;

            let outcome = self
                .retry
                .execute(&breaker, descriptor.call_timeout, |_| {
                    AssertUnwindSafe(backend.generate(&call_request))
                        .catch_unwind()
                        .map(|outcome| {
                            outcome.unwrap_or_else(|panic| {
                                Err(BackendError::permanent(panic_message(panic.as_ref())))
                            })
                        })
                })
                .await;

            match outcome {
                Ok(answer) => {
                    let served_by = if position == 0 {
                        ServedBy::Primary
                    } else {
                        tracing::info!(
                            request_id = %request.request_id,
                            from = %chain.primary().id,
                            to = %descriptor.id,
                            "Served by fallback backend"
                        );
                        ServedBy::Fallback
                    };
                    return Some(AnalysisResult::from_answer(
                        request,
                        &descriptor.id,
                        served_by,
                        answer,
                        std::mem::take(attempts),
                    ));
                }
                Err(failure) => {
                    tracing::warn!(
                        request_id = %request.request_id,
                        backend = %descriptor.id,
                        error = %failure,
                        "Backend failed, trying next in chain"
                    );
                    attempts.push(AttemptRecord::from_failure(&descriptor.id, &failure));
                }
            }
        }
        None
    }

    /// Call the terminal fallback without consulting its breaker
    async fn run_terminal(
        &self,
        chain: &FallbackChain,
        request: &AnswerRequest,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<AnalysisResult, EngineError> {
        let terminal = chain.terminal();
        let position = chain.len() - 1;
        let call_request = self.request_for(request, position);
        let breaker = self.registry.get_or_create(&terminal.id);

        if position > 0 {
            tracing::info!(
                request_id = %request.request_id,
                to = %terminal.id,
                "All fallible backends failed, using terminal fallback"
            );
        }

        let call = AssertUnwindSafe(terminal.backend.generate(&call_request)).catch_unwind();
        let outcome = match terminal.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(BackendError::Timeout(limit))),
            },
            None => call.await,
        };

        let (error_type, reason) = match outcome {
            Ok(Ok(answer)) => {
                breaker.record_success();
                let served_by = if position == 0 {
                    ServedBy::Primary
                } else {
                    ServedBy::TerminalFallback
                };
                return Ok(AnalysisResult::from_answer(
                    request,
                    &terminal.id,
                    served_by,
                    answer,
                    std::mem::take(attempts),
                ));
            }
            Ok(Err(error)) => (error.kind(), error.to_string()),
            Err(panic) => ("panic", panic_message(panic.as_ref())),
        };

        breaker.record_failure_as(error_type, &reason);
        Err(EngineError::TerminalFallbackFailed {
            backend_id: terminal.id.clone(),
            reason,
        })
    }

    fn request_for(&self, request: &AnswerRequest, position: usize) -> AnswerRequest {
        let mut call_request = request.clone();
        if position > 0 && self.adjust_fallback_temperature {
            call_request.temperature = fallback_temperature(request.temperature);
        }
        call_request
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
