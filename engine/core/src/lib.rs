//! Iris Engine - Resilience and Orchestration for Multi-Provider Answers
//!
//! This crate answers a user query by gathering data from many independent,
//! unreliable sources and passing that context to a chain of answer
//! providers. It is built to degrade gracefully: failing services are
//! isolated by circuit breakers, transient errors are retried with backoff,
//! slow sources are abandoned at a deadline, and a rule-based local
//! responder answers when every remote provider is down.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         RequestRouter                             │
//! │        profile ──► RoutePlan { sources, chain, deadline }         │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 │                                  │
//!                 ▼                                  ▼
//! ┌───────────────────────────────┐   ┌──────────────────────────────┐
//! │       ParallelCollector       │   │       FallbackExecutor        │
//! │  TtlCache ─► Semaphore ─►     │   │  primary ─► fallback ─► ...   │
//! │  JoinSet ─► deadline abort    │   │  ─► terminal ─► safety net    │
//! └───────────────┬───────────────┘   └──────────────┬───────────────┘
//!                 │   build_context ─────────────────►│
//!                 ▼                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │              RetryPolicy  +  BreakerRegistry (per service)        │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 ▼                                  ▼
//!         SourceBackend (fetch)              AnswerBackend (generate)
//! ```
//!
//! # Key Types
//!
//! - [`CircuitBreaker`]: per-service Closed / Open / HalfOpen state machine
//! - [`BreakerRegistry`]: one shared breaker per service id
//! - [`RetryPolicy`]: exponential backoff that composes with a breaker
//! - [`FallbackChain`] / [`FallbackExecutor`]: ordered answer providers
//! - [`ParallelCollector`]: bounded, deadline-aware fan-out with a TTL cache
//! - [`RequestRouter`]: profile resolution and end-to-end routing
//! - [`EngineConfig`]: TOML configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use iris_engine::{EngineConfig, RequestRouter};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(EngineConfig::load("engine.toml").await?);
//!     let mut router = RequestRouter::new(config);
//!     router.register_http_backends(&reqwest::Client::new());
//!
//!     let response = router.route_profile("smart", "What is the inflation rate?").await?;
//!     println!("{} (via {})", response.analysis.text, response.analysis.backend_id);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: error enums for backends, calls, config, chains and routing
//! - [`resilience`]: circuit breaker, registry, retry policy
//! - [`backend`]: capability traits, local responder, HTTP backends
//! - [`orchestration`]: cache, collector, context, fallback chain, router
//! - [`config`]: configuration loading and validation
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the binary.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod orchestration;
pub mod resilience;

// Re-exports for convenience
pub use backend::{
    Answer, AnswerBackend, AnswerRequest, BackendDescriptor, FetchRequest, HttpAnswerBackend,
    HttpSourceBackend, LocalResponder, SourceBackend, LOCAL_BACKEND_ID,
};
pub use config::{
    CacheConfig, ChainEntry, EngineConfig, HttpBackendConfig, HttpSourceConfig, ProfileConfig,
};
pub use error::{BackendError, CallFailure, ChainError, ConfigError, EngineError, RouterError};
pub use resilience::{
    BreakerParams, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState, RegistryStats,
    RetryPolicy, Severity,
};

// Orchestration exports
pub use orchestration::{
    build_context, AnalysisResult, AttemptRecord, CollectionReport, FallbackChain,
    FallbackExecutor, FetchResult, FetchStatus, GenerationConfig, ParallelCollector,
    RequestRouter, RoutePlan, RoutedResponse, ServedBy, TtlCache,
};
