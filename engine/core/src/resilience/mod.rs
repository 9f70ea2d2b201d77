//! Failure Isolation Primitives
//!
//! ```text
//!   caller ──► RetryPolicy::execute ──► CircuitBreaker::can_attempt ──► backend
//!                   │    ▲                        ▲
//!                   │    └── backoff, retry ──────┤
//!                   └──── record_success / record_failure
//! ```
//!
//! - [`breaker`]: per-service circuit breaker state machine
//! - [`registry`]: shared map handing every caller the same breaker per service
//! - [`retry`]: bounded exponential backoff that composes with a breaker

#![allow(missing_docs)]

pub mod breaker;
pub mod registry;
pub mod retry;

pub use breaker::{
    BreakerParams, BreakerSnapshot, CircuitBreaker, CircuitState, FailureRecord, Severity,
};
pub use registry::{BreakerRegistry, RegistryStats};
pub use retry::RetryPolicy;
