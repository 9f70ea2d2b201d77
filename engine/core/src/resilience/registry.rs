//! Breaker Registry
//!
//! The one deliberately shared mutable structure in the engine: a map from
//! service id to its [`CircuitBreaker`]. Construct one per process and hand
//! it to every component as `Arc<BreakerRegistry>`; all callers asking for
//! the same id get the same breaker.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::breaker::{BreakerParams, BreakerSnapshot, CircuitBreaker, CircuitState};

/// Breaker counts by state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

/// Process-wide map of circuit breakers
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,

    /// Params for services without an override
    defaults: BreakerParams,

    /// Per-service params applied on first use
    overrides: HashMap<String, BreakerParams>,
}

impl BreakerRegistry {
    /// Create an empty registry where every service uses `defaults`
    #[must_use]
    pub fn new(defaults: BreakerParams) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
        }
    }

    /// Create a registry with per-service overrides
    #[must_use]
    pub fn with_overrides(
        defaults: BreakerParams,
        overrides: HashMap<String, BreakerParams>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides,
        }
    }

    /// Params a breaker for `service_id` is (or would be) created with
    #[must_use]
    pub fn params_for(&self, service_id: &str) -> BreakerParams {
        self.overrides
            .get(service_id)
            .copied()
            .unwrap_or(self.defaults)
    }

    /// Get the breaker for a service, creating it on first use
    pub fn get_or_create(&self, service_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service_id) {
            return Arc::clone(existing.value());
        }

        Arc::clone(
            self.breakers
                .entry(service_id.to_string())
                .or_insert_with(|| {
                    tracing::debug!(service = %service_id, "Registering circuit breaker");
                    Arc::new(CircuitBreaker::new(service_id, self.params_for(service_id)))
                })
                .value(),
        )
    }

    /// Get an existing breaker
    #[must_use]
    pub fn get(&self, service_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service_id).map(|b| Arc::clone(b.value()))
    }

    /// Register a breaker with explicit params, replacing any existing one
    pub fn register(&self, service_id: &str, params: BreakerParams) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(service_id, params));
        self.breakers
            .insert(service_id.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Number of registered breakers
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker has been created yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Services whose breaker is currently open or half-open
    #[must_use]
    pub fn open_services(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().state() != CircuitState::Closed)
            .map(|entry| entry.key().clone())
            .collect();
        open.sort();
        open
    }

    /// Snapshots of every breaker, sorted by service id
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        snapshots
    }

    /// Count breakers by state
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in &self.breakers {
            stats.total += 1;
            match entry.value().state() {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
        }
        stats
    }

    /// Reset every breaker to Closed
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerParams::default())
    }
}
