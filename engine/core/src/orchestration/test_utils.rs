//! Mock Backends for Orchestration Tests
//!
//! `MockAnswerBackend` scripts the outcome of every call and records what it
//! was asked, so tests can assert which chain members ran and with which
//! parameters. `MockSourceBackend` does the same for data sources.
//!
//! ```ignore
//! let groq = MockAnswerBackend::failing("groq", BackendError::transient("503"));
//! let local = MockAnswerBackend::succeeding("local", "rule-based");
//! // ... run the chain ...
//! assert_eq!(groq.call_count(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use serde_json::Value;

use crate::backend::{Answer, AnswerBackend, AnswerRequest, FetchRequest, SourceBackend};
use crate::error::BackendError;

/// What a mock does when called
#[derive(Clone, Debug)]
pub enum MockOutcome {
    Succeed(String),
    Fail(BackendError),
    Panic,
}

/// Scripted answer backend
pub struct MockAnswerBackend {
    id: String,
    outcome: Mutex<MockOutcome>,
    calls: AtomicUsize,
    requests: Mutex<Vec<AnswerRequest>>,
}

impl MockAnswerBackend {
    pub fn new(id: &str, outcome: MockOutcome) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            outcome: Mutex::new(outcome),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(id: &str, text: &str) -> Arc<Self> {
        Self::new(id, MockOutcome::Succeed(text.to_string()))
    }

    pub fn failing(id: &str, error: BackendError) -> Arc<Self> {
        Self::new(id, MockOutcome::Fail(error))
    }

    pub fn panicking(id: &str) -> Arc<Self> {
        Self::new(id, MockOutcome::Panic)
    }

    /// Change the outcome of subsequent calls
    pub fn set_outcome(&self, outcome: MockOutcome) {
        *self.outcome.lock() = outcome;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<AnswerRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AnswerBackend for MockAnswerBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: &AnswerRequest) -> Result<Answer, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let outcome = self.outcome.lock().clone();
        match outcome {
            MockOutcome::Succeed(text) => Ok(Answer {
                text,
                model: Some(format!("{}-model", self.id)),
                tokens_used: Some(10),
            }),
            MockOutcome::Fail(error) => Err(error),
            MockOutcome::Panic => panic!("mock backend {} panicked", self.id),
        }
    }
}

/// Scripted data source
pub struct MockSourceBackend {
    id: String,
    outcome: Mutex<Result<Value, BackendError>>,
    calls: AtomicUsize,
}

impl MockSourceBackend {
    pub fn returning(id: &str, payload: Value) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            outcome: Mutex::new(Ok(payload)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(id: &str, error: BackendError) -> Arc<Self> {
        let source = Self::returning(id, Value::Null);
        source.set_outcome(Err(error));
        source
    }

    pub fn set_outcome(&self, outcome: Result<Value, BackendError>) {
        *self.outcome.lock() = outcome;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceBackend for MockSourceBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<Value, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.lock().clone()
    }
}
