//! Engine Configuration
//!
//! TOML-backed settings for every engine component. All sections are
//! optional; missing values take the defaults below.
//!
//! Configuration file location: `~/.config/iris/engine.toml`
//!
//! ```toml
//! max_concurrent_fetches = 8
//! collection_timeout_ms = 10000
//!
//! [breaker_defaults]
//! failure_threshold = 5
//! open_timeout_ms = 60000
//!
//! [breakers.scb]
//! failure_threshold = 3
//! open_timeout_ms = 120000
//!
//! [cache.ttls]
//! omx = 300
//!
//! [profiles.smart]
//! sources = ["scb", "omx"]
//! chain = [
//!   { backend_id = "groq", priority = 0 },
//!   { backend_id = "local", priority = 1 },
//! ]
//! ```
//!
//! A config is validated once on load and then shared read-only.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::LOCAL_BACKEND_ID;
use crate::error::{ChainError, ConfigError};
use crate::resilience::{BreakerParams, BreakerRegistry, RetryPolicy};

// ============================================================================
// Sections
// ============================================================================

/// Source result caching
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for sources without an override
    pub default_ttl_secs: u64,

    /// How long expired entries stay available for degraded results
    pub stale_retention_secs: u64,

    /// Per-source TTL overrides
    pub ttls: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3_600,
            stale_retention_secs: 86_400,
            ttls: HashMap::new(),
        }
    }
}

/// An HTTP answer backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    pub endpoint: String,

    #[serde(default)]
    pub model: Option<String>,

    /// Environment variable holding the bearer token
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Per-call timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl HttpBackendConfig {
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// An HTTP data source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    pub url: String,

    /// Per-call timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl HttpSourceConfig {
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// One member of a profile's fallback chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub backend_id: String,
    /// Lower runs first
    #[serde(default)]
    pub priority: u32,
}

/// Named request shape: which sources to collect and which chain answers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub chain: Vec<ChainEntry>,
    pub sources: Vec<String>,
    /// Sources beyond this count are not collected
    pub max_sources: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            chain: vec![ChainEntry {
                backend_id: LOCAL_BACKEND_ID.to_string(),
                priority: 0,
            }],
            sources: Vec::new(),
            max_sources: 5,
            temperature: 0.7,
            max_tokens: 1_000,
        }
    }
}

impl ProfileConfig {
    /// Chain entries in execution order (stable by priority)
    #[must_use]
    pub fn ordered_chain(&self) -> Vec<&ChainEntry> {
        let mut entries: Vec<&ChainEntry> = self.chain.iter().collect();
        entries.sort_by_key(|e| e.priority);
        entries
    }

    /// Sources to collect, truncated to `max_sources`
    #[must_use]
    pub fn selected_sources(&self) -> Vec<String> {
        self.sources.iter().take(self.max_sources).cloned().collect()
    }

    fn validate_chain(&self) -> Result<(), ChainError> {
        let ordered = self.ordered_chain();
        let Some(last) = ordered.last() else {
            return Err(ChainError::Empty);
        };

        let mut seen = HashSet::new();
        for entry in &ordered {
            if !seen.insert(entry.backend_id.as_str()) {
                return Err(ChainError::DuplicateBackend(entry.backend_id.clone()));
            }
        }

        if !seen.contains(LOCAL_BACKEND_ID) {
            return Err(ChainError::MissingTerminal);
        }
        if last.backend_id != LOCAL_BACKEND_ID {
            return Err(ChainError::TerminalNotLast(LOCAL_BACKEND_ID.to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Engine Config
// ============================================================================

/// Complete engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Source fetches in flight at once
    pub max_concurrent_fetches: usize,

    /// Deadline for one source collection
    pub collection_timeout_ms: u64,

    /// Breaker parameters for services without an override
    pub breaker_defaults: BreakerParams,

    /// Per-service breaker overrides
    pub breakers: HashMap<String, BreakerParams>,

    pub retry: RetryPolicy,

    pub cache: CacheConfig,

    /// HTTP answer backends by id
    pub backends: HashMap<String, HttpBackendConfig>,

    /// HTTP data sources by id
    pub sources: HashMap<String, HttpSourceConfig>,

    /// Named profiles
    pub profiles: HashMap<String, ProfileConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            collection_timeout_ms: 10_000,
            breaker_defaults: BreakerParams::default(),
            breakers: HashMap::new(),
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            backends: HashMap::new(),
            sources: HashMap::new(),
            profiles: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Default config file path (`<config_dir>/iris/engine.toml`)
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("iris").join("engine.toml"))
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML and the matching
    /// validation error for out-of-range values.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise the
    /// errors of [`EngineConfig::from_toml_str`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let config = Self::from_toml_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            profiles = config.profiles.len(),
            backends = config.backends.len(),
            sources = config.sources.len(),
            "Loaded engine config"
        );
        Ok(config)
    }

    /// Check every value range and every profile chain
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::invalid("max_concurrent_fetches", "must be at least 1"));
        }
        if self.collection_timeout_ms == 0 {
            return Err(ConfigError::invalid("collection_timeout_ms", "must be greater than 0"));
        }

        if self.backends.contains_key(LOCAL_BACKEND_ID) {
            return Err(ConfigError::invalid(
                format!("backends.{LOCAL_BACKEND_ID}"),
                "id is reserved for the built-in local responder",
            ));
        }
        if self.sources.contains_key(LOCAL_BACKEND_ID) {
            return Err(ConfigError::invalid(
                format!("sources.{LOCAL_BACKEND_ID}"),
                "id is reserved for the built-in local responder",
            ));
        }

        validate_retry(&self.retry)?;
        validate_breaker("breaker_defaults", &self.breaker_defaults)?;
        for (service, params) in &self.breakers {
            validate_breaker(&format!("breakers.{service}"), params)?;
        }

        for (name, profile) in &self.profiles {
            if !(0.0..=1.0).contains(&profile.temperature) {
                return Err(ConfigError::invalid(
                    format!("profiles.{name}.temperature"),
                    "must be within 0.0..=1.0",
                ));
            }
            profile
                .validate_chain()
                .map_err(|source| ConfigError::Chain {
                    profile: name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Breaker parameters for a service (override or default)
    #[must_use]
    pub fn breaker_params(&self, service_id: &str) -> BreakerParams {
        self.breakers
            .get(service_id)
            .copied()
            .unwrap_or(self.breaker_defaults)
    }

    /// Cache TTL for a source (override or default)
    #[must_use]
    pub fn cache_ttl(&self, source_id: &str) -> Duration {
        let secs = self
            .cache
            .ttls
            .get(source_id)
            .copied()
            .unwrap_or(self.cache.default_ttl_secs);
        Duration::from_secs(secs)
    }

    /// Retention of expired cache entries
    #[must_use]
    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.cache.stale_retention_secs)
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn collection_timeout(&self) -> Duration {
        Duration::from_millis(self.collection_timeout_ms)
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.get(name)
    }

    /// Profile names, sorted
    #[must_use]
    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registry applying the configured defaults and overrides
    #[must_use]
    pub fn build_registry(&self) -> BreakerRegistry {
        BreakerRegistry::with_overrides(self.breaker_defaults, self.breakers.clone())
    }
}

fn validate_retry(retry: &RetryPolicy) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
    }
    if retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::invalid("retry.backoff_multiplier", "must be at least 1.0"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(ConfigError::invalid(
            "retry.base_delay_ms",
            format!(
                "{} exceeds max_delay_ms {}",
                retry.base_delay_ms, retry.max_delay_ms
            ),
        ));
    }
    if !(0.0..1.0).contains(&retry.jitter) {
        return Err(ConfigError::invalid("retry.jitter", "must be within 0.0..1.0"));
    }
    Ok(())
}

fn validate_breaker(field: &str, params: &BreakerParams) -> Result<(), ConfigError> {
    if params.failure_threshold == 0 {
        return Err(ConfigError::invalid(
            format!("{field}.failure_threshold"),
            "must be at least 1",
        ));
    }
    if params.open_timeout_ms == 0 {
        return Err(ConfigError::invalid(
            format!("{field}.open_timeout_ms"),
            "must be greater than 0",
        ));
    }
    Ok(())
}
