//! Request Router
//!
//! Boundary between callers and the engine. A named profile resolves into a
//! [`RoutePlan`]; routing a query runs the plan end to end.
//!
//! ```text
//!   query ──► plan_for_profile ──► ParallelCollector::collect ──► build_context
//!                                                                     │
//!   RoutedResponse ◄──── FallbackExecutor::execute ◄──────────────────┘
//! ```
//!
//! Choosing a profile from the query text is left to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::cache::TtlCache;
use super::collector::{CollectionReport, ParallelCollector};
use super::context::build_context;
use super::fallback::{AnalysisResult, FallbackChain, FallbackExecutor};
use crate::backend::{
    AnswerBackend, AnswerRequest, BackendDescriptor, FetchRequest, HttpAnswerBackend,
    HttpSourceBackend, LocalResponder, SourceBackend, LOCAL_BACKEND_ID,
};
use crate::config::EngineConfig;
use crate::error::RouterError;
use crate::resilience::BreakerRegistry;

// ============================================================================
// Plans and Responses
// ============================================================================

/// Generation parameters handed to the chain
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Everything needed to answer one query under a profile
#[derive(Clone, Debug)]
pub struct RoutePlan {
    pub profile: String,
    pub chain: FallbackChain,
    /// Sources to collect, already truncated
    pub sources: Vec<String>,
    pub generation: GenerationConfig,
    /// Collection deadline
    pub deadline: Duration,
}

/// Outcome of routing one query
#[derive(Clone, Debug, Serialize)]
pub struct RoutedResponse {
    pub analysis: AnalysisResult,
    pub sources: CollectionReport,
    /// Context the chain was given
    pub context: String,
    pub elapsed_ms: u64,
}

#[derive(Clone)]
struct RegisteredBackend {
    backend: Arc<dyn AnswerBackend>,
    call_timeout: Option<Duration>,
}

// ============================================================================
// Router
// ============================================================================

/// Resolves profiles and runs collection plus answer generation
pub struct RequestRouter {
    config: Arc<EngineConfig>,
    registry: Arc<BreakerRegistry>,
    collector: ParallelCollector,
    executor: FallbackExecutor,
    answer_backends: HashMap<String, RegisteredBackend>,
}

impl RequestRouter {
    /// Build a router over `config` with only the local responder registered
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let registry = Arc::new(config.build_registry());
        let cache = Arc::new(TtlCache::<Value>::new(config.stale_retention()));
        let collector = ParallelCollector::new(
            Arc::clone(&registry),
            cache,
            config.retry_policy().clone(),
            config.max_concurrent_fetches,
        );
        let executor =
            FallbackExecutor::new(Arc::clone(&registry), config.retry_policy().clone());

        let mut router = Self {
            config,
            registry,
            collector,
            executor,
            answer_backends: HashMap::new(),
        };
        router.register_answer_backend(Arc::new(LocalResponder::new()), None);
        router
    }

    /// Replace the chain executor (e.g. to disable temperature adjustment)
    #[must_use]
    pub fn with_executor(mut self, executor: FallbackExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Register an answer backend under its id
    ///
    /// The local responder registered by [`RequestRouter::new`] is never
    /// replaced; a second backend claiming its id is ignored.
    pub fn register_answer_backend(
        &mut self,
        backend: Arc<dyn AnswerBackend>,
        call_timeout: Option<Duration>,
    ) {
        let id = backend.id().to_string();
        if id == LOCAL_BACKEND_ID && self.answer_backends.contains_key(LOCAL_BACKEND_ID) {
            tracing::warn!(backend = %id, "Refusing to replace the local responder");
            return;
        }
        tracing::debug!(backend = %id, "Registering answer backend");
        self.answer_backends.insert(
            id,
            RegisteredBackend {
                backend,
                call_timeout,
            },
        );
    }

    /// Register a data source; its cache TTL comes from config
    pub fn register_source(
        &mut self,
        backend: Arc<dyn SourceBackend>,
        call_timeout: Option<Duration>,
    ) {
        let ttl = self.config.cache_ttl(backend.id());
        self.collector.register_source(backend, ttl, call_timeout);
    }

    /// Register every HTTP backend and source named in config
    ///
    /// Backends whose `api_key_env` variable is unset are registered without
    /// a key; the provider decides whether that is acceptable.
    pub fn register_http_backends(&mut self, client: &reqwest::Client) {
        let config = Arc::clone(&self.config);
        let status_codes = config.retry_policy().retry_status_codes.clone();

        for (id, settings) in &config.backends {
            let mut backend = HttpAnswerBackend::new(
                id.as_str(),
                settings.endpoint.as_str(),
                status_codes.clone(),
                client.clone(),
            );
            if let Some(model) = &settings.model {
                backend = backend.with_model(model.as_str());
            }
            if let Some(var) = &settings.api_key_env {
                match std::env::var(var) {
                    Ok(key) => backend = backend.with_api_key(key),
                    Err(_) => tracing::warn!(backend = %id, env = %var, "API key variable not set"),
                }
            }
            self.register_answer_backend(Arc::new(backend), settings.call_timeout());
        }

        for (id, settings) in &config.sources {
            let source = HttpSourceBackend::new(
                id.as_str(),
                settings.url.as_str(),
                status_codes.clone(),
                client.clone(),
            );
            self.register_source(Arc::new(source), settings.call_timeout());
        }
    }

    /// Registered answer backend ids, sorted
    #[must_use]
    pub fn answer_backend_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.answer_backends.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn collector(&self) -> &ParallelCollector {
        &self.collector
    }

    /// Resolve a profile into a plan bound to registered backends
    ///
    /// # Errors
    ///
    /// Unknown profile, unregistered backend, or a malformed chain.
    pub fn plan_for_profile(&self, name: &str) -> Result<RoutePlan, RouterError> {
        let profile = self
            .config
            .profile(name)
            .ok_or_else(|| RouterError::UnknownProfile(name.to_string()))?;

        let mut descriptors = Vec::with_capacity(profile.chain.len());
        for entry in &profile.chain {
            let registered = self.answer_backends.get(&entry.backend_id).ok_or_else(|| {
                RouterError::UnknownBackend {
                    profile: name.to_string(),
                    backend_id: entry.backend_id.clone(),
                }
            })?;

            let backend = Arc::clone(&registered.backend);
            let mut descriptor = if entry.backend_id == LOCAL_BACKEND_ID {
                BackendDescriptor::terminal(backend, entry.priority)
            } else {
                BackendDescriptor::new(backend, entry.priority)
            };
            if let Some(limit) = registered.call_timeout {
                descriptor = descriptor.with_call_timeout(limit);
            }
            descriptors.push(descriptor);
        }

        Ok(RoutePlan {
            profile: name.to_string(),
            chain: FallbackChain::new(descriptors)?,
            sources: profile.selected_sources(),
            generation: GenerationConfig {
                temperature: profile.temperature,
                max_tokens: profile.max_tokens,
            },
            deadline: self.config.collection_timeout(),
        })
    }

    /// Collect sources, build context, and run the chain
    pub async fn route(&self, plan: &RoutePlan, query: &str) -> RoutedResponse {
        let started = Instant::now();
        let request = AnswerRequest::new(query)
            .with_temperature(plan.generation.temperature)
            .with_max_tokens(plan.generation.max_tokens);

        tracing::info!(
            request_id = %request.request_id,
            profile = %plan.profile,
            sources = plan.sources.len(),
            "Routing query"
        );

        let report = self
            .collector
            .collect(&plan.sources, &FetchRequest::new(query), plan.deadline)
            .await;
        let context = build_context(&report);

        tracing::debug!(
            request_id = %request.request_id,
            ok = report.ok_count(),
            degraded = report.degraded_count(),
            failed = report.failed_count(),
            "Source collection finished"
        );

        let request = request.with_context(context.clone());
        let analysis = self.executor.execute(&plan.chain, &request).await;

        RoutedResponse {
            analysis,
            sources: report,
            context,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Plan and route in one step
    ///
    /// # Errors
    ///
    /// Any error of [`RequestRouter::plan_for_profile`].
    pub async fn route_profile(
        &self,
        name: &str,
        query: &str,
    ) -> Result<RoutedResponse, RouterError> {
        let plan = self.plan_for_profile(name)?;
        Ok(self.route(&plan, query).await)
    }
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("answer_backends", &self.answer_backend_ids())
            .field("collector", &self.collector)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}
