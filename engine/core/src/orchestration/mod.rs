//! Request Orchestration
//!
//! Composes the resilience primitives into the two request-level flows:
//! fan-out collection from data sources and fallback-chained answer
//! generation.
//!
//! ```text
//!                    +-----------------+
//!                    |  RequestRouter  |  <-- profile -> RoutePlan
//!                    +--------+--------+
//!                             |
//!              +--------------+--------------+
//!              v                             v
//!   +---------------------+       +---------------------+
//!   |  ParallelCollector  |       |  FallbackExecutor   |
//!   |  (TtlCache, permits)|       |  (FallbackChain)    |
//!   +----------+----------+       +----------+----------+
//!              |       build_context         |
//!              +------------->---------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Complete results**: every requested source gets an entry, even on timeout
//! 2. **Breaker first**: no backend is called while its circuit is open
//! 3. **Always answer**: the terminal fallback and the safety net end every chain

#![allow(missing_docs)]

pub mod cache;
pub mod collector;
pub mod context;
pub mod fallback;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use cache::{CacheKey, CacheStats, StaleValue, TtlCache};
pub use collector::{CollectionReport, FetchResult, FetchStatus, ParallelCollector};
pub use context::{build_context, EMPTY_CONTEXT};
pub use fallback::{
    fallback_temperature, AnalysisResult, AttemptRecord, FallbackChain, FallbackExecutor,
    QueryIntent, ServedBy, SAFETY_NET_ID,
};
pub use router::{GenerationConfig, RequestRouter, RoutePlan, RoutedResponse};
