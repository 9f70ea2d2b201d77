//! Backend Capability Traits
//!
//! Two capabilities cover every backend the engine talks to:
//!
//! - [`AnswerBackend`] (GenerateAnswer): language-model style backends that
//!   turn a query plus context into text
//! - [`SourceBackend`] (FetchSourceData): read-only data sources that return
//!   an opaque JSON payload
//!
//! Both report failures as [`BackendError`] so the retry policy can tell a
//! transient condition from a permanent one. Provider wire formats stay inside
//! the implementations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackendError;

// ============================================================================
// Answer Generation
// ============================================================================

/// Request handed to an answer backend
#[derive(Clone, Debug, Serialize)]
pub struct AnswerRequest {
    /// Correlation id for logs
    pub request_id: Uuid,
    /// The user's question
    pub query: String,
    /// Context assembled from data sources
    pub context: Option<String>,
    /// Backend-specific model override
    pub model: Option<String>,
    /// Temperature (0.0-1.0, higher = more creative)
    pub temperature: f32,
    /// Maximum tokens in response (0 = backend default)
    pub max_tokens: u32,
}

impl Default for AnswerRequest {
    fn default() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            query: String::new(),
            context: None,
            model: None,
            temperature: 0.7,
            max_tokens: 0,
        }
    }
}

impl AnswerRequest {
    /// Create a request for a query
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Set context
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Text produced by an answer backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    /// The response text
    pub text: String,
    /// Model that generated the response
    pub model: Option<String>,
    /// Tokens used (if reported)
    pub tokens_used: Option<u32>,
}

impl Answer {
    /// Create an answer with only text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            tokens_used: None,
        }
    }
}

/// GenerateAnswer capability
#[async_trait]
pub trait AnswerBackend: Send + Sync {
    /// Stable id; also the key of this backend's circuit breaker
    fn id(&self) -> &str;

    /// Whether the backend can stream (informational)
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Generate an answer
    async fn generate(&self, request: &AnswerRequest) -> Result<Answer, BackendError>;
}

// ============================================================================
// Source Fetching
// ============================================================================

/// Request handed to a data source
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FetchRequest {
    /// Query the data should relate to
    pub query: String,
    /// Extra source parameters, ordered for stable fingerprints
    pub params: BTreeMap<String, String>,
}

impl FetchRequest {
    /// Create a fetch request for a query
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Stable fingerprint used as the cache key alongside the source id
    #[must_use]
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.query.as_bytes());
        for (key, value) in &self.params {
            hasher.update(&[0]);
            hasher.update(key.as_bytes());
            hasher.update(&[b'=']);
            hasher.update(value.as_bytes());
        }
        hasher.finalize()
    }
}

/// FetchSourceData capability
#[async_trait]
pub trait SourceBackend: Send + Sync {
    /// Source id; also the key of this source's circuit breaker
    fn id(&self) -> &str;

    /// Fetch the source's payload for a request
    async fn fetch(&self, request: &FetchRequest) -> Result<serde_json::Value, BackendError>;
}

// ============================================================================
// Backend Descriptor
// ============================================================================

/// An answer backend placed in a fallback chain
#[derive(Clone)]
pub struct BackendDescriptor {
    /// Backend id
    pub id: String,
    /// The callable capability
    pub backend: Arc<dyn AnswerBackend>,
    /// Position in the chain (lower runs first)
    pub priority: u32,
    /// Informational only
    pub supports_streaming: bool,
    /// Guaranteed never to fail by contract; must be last in its chain
    pub is_terminal_fallback: bool,
    /// Bound for each individual call
    pub call_timeout: Option<Duration>,
}

impl BackendDescriptor {
    /// Describe a regular (fallible) backend
    pub fn new(backend: Arc<dyn AnswerBackend>, priority: u32) -> Self {
        Self {
            id: backend.id().to_string(),
            supports_streaming: backend.supports_streaming(),
            backend,
            priority,
            is_terminal_fallback: false,
            call_timeout: None,
        }
    }

    /// Describe the chain's terminal fallback
    pub fn terminal(backend: Arc<dyn AnswerBackend>, priority: u32) -> Self {
        Self {
            is_terminal_fallback: true,
            ..Self::new(backend, priority)
        }
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("supports_streaming", &self.supports_streaming)
            .field("is_terminal_fallback", &self.is_terminal_fallback)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}
