//! Error types for the resilience engine
//!
//! Failures are values here. A backend reports a [`BackendError`], a
//! protected call resolves to a [`CallFailure`], and only configuration,
//! wiring and the terminal-fallback contract produce errors a caller has to
//! handle.

use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Backend Errors
// ============================================================================

/// Failure reported by a backend capability
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Worth retrying: rate limits, connection resets, 5xx responses
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Not worth retrying: malformed requests, rejected credentials
    #[error("permanent backend error: {0}")]
    Permanent(String),

    /// The individual call exceeded its timeout
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    /// Shorthand for a transient failure
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    /// Shorthand for a permanent failure
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Short error class used in breaker statistics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Whether the retry policy may try again after this error
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

// ============================================================================
// Call Outcomes
// ============================================================================

/// Outcome of a call protected by a circuit breaker and a retry policy
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallFailure {
    /// Every attempt failed transiently
    #[error("gave up after {attempts} attempt(s): {last}")]
    Transient {
        /// Attempts actually made
        attempts: u32,
        /// Error of the final attempt
        last: BackendError,
    },

    /// An attempt failed in a way retrying cannot fix
    #[error("permanent failure on attempt {attempts}: {last}")]
    Permanent {
        /// Attempts made, including the failing one
        attempts: u32,
        /// The permanent error
        last: BackendError,
    },

    /// The breaker denied the attempt; nothing was sent
    #[error("circuit open for {service_id}")]
    CircuitOpen {
        /// Service whose breaker is open
        service_id: String,
    },

    /// The collection deadline elapsed before the call resolved
    #[error("abandoned at collection deadline after {after:?}")]
    Timeout {
        /// Deadline that elapsed
        after: Duration,
    },
}

impl CallFailure {
    /// Whether this failure was produced locally by an open breaker
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether this failure is the collection deadline
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

// ============================================================================
// Wiring Errors
// ============================================================================

/// Invalid fallback chain shape
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// Chain has no backends
    #[error("fallback chain is empty")]
    Empty,

    /// No backend is marked as terminal fallback
    #[error("fallback chain has no terminal fallback")]
    MissingTerminal,

    /// More than one backend is marked as terminal fallback
    #[error("fallback chain has {0} terminal fallbacks, expected exactly one")]
    MultipleTerminals(usize),

    /// The terminal fallback is not ordered last
    #[error("terminal fallback '{0}' is not the last backend in the chain")]
    TerminalNotLast(String),

    /// The same backend appears twice
    #[error("backend '{0}' appears more than once in the chain")]
    DuplicateBackend(String),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// A profile chain is malformed
    #[error("profile '{profile}' has an invalid chain: {source}")]
    Chain {
        /// Profile name
        profile: String,
        /// Shape violation
        #[source]
        source: ChainError,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors resolving a profile into a route plan
#[derive(Debug, Error)]
pub enum RouterError {
    /// No profile with this name is configured
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),

    /// A chain references a backend that was never registered
    #[error("profile '{profile}' references unregistered backend '{backend_id}'")]
    UnknownBackend {
        /// Profile name
        profile: String,
        /// Missing backend id
        backend_id: String,
    },

    /// The bound chain is malformed
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Contract violations surfaced by the strict execution path
#[derive(Debug, Error)]
pub enum EngineError {
    /// The terminal fallback returned an error or panicked
    #[error("terminal fallback '{backend_id}' violated its contract: {reason}")]
    TerminalFallbackFailed {
        /// Terminal backend id
        backend_id: String,
        /// Error text or panic message
        reason: String,
    },
}
