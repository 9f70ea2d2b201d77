//! HTTP Backends
//!
//! Generic JSON-over-HTTP implementations of both capabilities.
//!
//! # Endpoints
//!
//! - [`HttpSourceBackend`]: `GET <url>?q=<query>&<params>` returning any JSON
//!   document, which becomes the source payload as-is
//! - [`HttpAnswerBackend`]: `POST <endpoint>` with
//!   `{model, prompt, context, temperature, max_tokens}`, expecting
//!   `{text, tokens_used?, model?}`
//!
//! Failures are classified for the retry policy: configured retryable status
//! codes, connect errors and timeouts are transient; every other non-success
//! status and undecodable bodies are permanent.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::traits::{Answer, AnswerBackend, AnswerRequest, FetchRequest, SourceBackend};
use crate::error::BackendError;

/// Turn a non-success status into a classified error
pub fn classify_status(status: StatusCode, body: &str, retry_status_codes: &[u16]) -> BackendError {
    let reason = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(body, 200))
    };

    if retry_status_codes.contains(&status.as_u16()) {
        BackendError::Transient(reason)
    } else {
        BackendError::Permanent(reason)
    }
}

/// Turn a transport-level error into a classified error
pub fn classify_transport(error: &reqwest::Error) -> BackendError {
    if error.is_decode() || error.is_builder() {
        BackendError::Permanent(error.to_string())
    } else {
        BackendError::Transient(error.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

async fn error_for(response: reqwest::Response, retry_status_codes: &[u16]) -> BackendError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body, retry_status_codes)
}

// ============================================================================
// Source Backend
// ============================================================================

/// Data source served by a JSON HTTP endpoint
#[derive(Clone, Debug)]
pub struct HttpSourceBackend {
    id: String,
    url: String,
    retry_status_codes: Vec<u16>,
    http_client: reqwest::Client,
}

impl HttpSourceBackend {
    /// Create a source backend
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        retry_status_codes: Vec<u16>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            retry_status_codes,
            http_client,
        }
    }
}

#[async_trait]
impl SourceBackend for HttpSourceBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<serde_json::Value, BackendError> {
        let response = self
            .http_client
            .get(&self.url)
            .query(&[("q", request.query.as_str())])
            .query(&request.params)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        if !response.status().is_success() {
            return Err(error_for(response, &self.retry_status_codes).await);
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| BackendError::Permanent(format!("invalid JSON from {}: {e}", self.id)))
    }
}

// ============================================================================
// Answer Backend
// ============================================================================

#[derive(Debug, Deserialize)]
struct GenerateReply {
    text: String,
    #[serde(default)]
    tokens_used: Option<u32>,
    #[serde(default)]
    model: Option<String>,
}

/// Answer backend served by a JSON HTTP endpoint
#[derive(Clone)]
pub struct HttpAnswerBackend {
    id: String,
    endpoint: String,
    model: Option<String>,
    api_key: Option<String>,
    retry_status_codes: Vec<u16>,
    http_client: reqwest::Client,
}

impl HttpAnswerBackend {
    /// Create an answer backend
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        retry_status_codes: Vec<u16>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            model: None,
            api_key: None,
            retry_status_codes,
            http_client,
        }
    }

    /// Default model sent when the request has no override
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Bearer token sent with every request
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

impl std::fmt::Debug for HttpAnswerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAnswerBackend")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AnswerBackend for HttpAnswerBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: &AnswerRequest) -> Result<Answer, BackendError> {
        let model = request.model.as_ref().or(self.model.as_ref());
        let body = serde_json::json!({
            "model": model,
            "prompt": request.query,
            "context": request.context,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let mut call = self.http_client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.map_err(|e| classify_transport(&e))?;
        if !response.status().is_success() {
            return Err(error_for(response, &self.retry_status_codes).await);
        }

        let reply: GenerateReply = response
            .json()
            .await
            .map_err(|e| BackendError::Permanent(format!("invalid reply from {}: {e}", self.id)))?;

        Ok(Answer {
            text: reply.text,
            model: reply.model.or_else(|| model.cloned()),
            tokens_used: reply.tokens_used,
        })
    }
}
