//! # Error Handling
//!
//! All failures in the engine are variants of [`EngineError`]. Errors are
//! structured values: each variant carries a stable [`EngineError::kind`]
//! discriminator plus the context a caller needs (JSON paths, step ids,
//! cycle paths). Expected error classes never cross the API boundary as
//! panics; a workflow execution always returns a result.
//!
//! Two recovery policies apply:
//!
//! - **Recovered locally**: transient HTTP failures subject to retry
//!   ([`retry`]), and breaker trips that route to a fallback task
//!   ([`circuit_breaker`]).
//! - **Surfaced**: validation and planning errors, step failures with no
//!   remaining retries and no fallback, cancellations, timeouts, and
//!   sub-workflow cycle/depth violations.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitDecision, CircuitHealth, CircuitRecord,
    CircuitState, CircuitStore, InMemoryCircuitStore,
};
pub use retry::{retry_with_policy, RetryOutcome, RetryPolicy};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Violation;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Primary error type for all engine operations.
///
/// Variants map one-to-one onto the stable wire-level error kinds returned
/// by [`EngineError::kind`]; collaborators (gateway, webhook, CLI) switch
/// on the kind string rather than on display text.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The schema document itself is malformed (for example an invalid
    /// `pattern` regex). Fatal for the spec that carries it.
    #[error("invalid schema document: {message}")]
    SchemaInvalid { message: String },

    /// A value did not satisfy its JSON schema.
    #[error("validation failed: {}", format_violations(.violations))]
    ValidationFailed { violations: Vec<Violation> },

    /// A task document is structurally unusable (an HTTP task without a
    /// URL, a step referencing both a task and a workflow, and so on).
    #[error("invalid task '{reference}': {message}")]
    InvalidTask { reference: String, message: String },

    /// Template text could not be parsed: unbalanced braces or an
    /// unrecognized root identifier.
    #[error("malformed template {template:?}: {message}")]
    TemplateMalformed { template: String, message: String },

    /// Strict resolution was requested and a referenced path is absent
    /// from the execution context.
    #[error("template expression {expression:?} resolved to nothing")]
    TemplateMissing { expression: String },

    /// Two steps in one workflow share an id.
    #[error("duplicate step id '{step_id}'")]
    DuplicateId { step_id: String },

    /// A `dependsOn` entry or `tasks.<id>` expression names a step that
    /// does not exist in the workflow.
    #[error("step '{step_id}' references unknown step '{reference}'")]
    UnknownDependency { step_id: String, reference: String },

    /// The dependency relation is not a DAG. The cycle path begins and
    /// ends at the same step id.
    #[error("circular dependency: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// A dataflow edge connects a producer field to a consumer parameter
    /// with a different declared type, or the field is missing entirely.
    #[error("step '{step_id}' input '{field}' is incompatible: expected {expected}, found {found}")]
    TypeIncompatible {
        step_id: String,
        field: String,
        expected: String,
        found: String,
    },

    /// The task catalog has no entry for the reference.
    #[error("task '{reference}' not found")]
    TaskNotFound { reference: String },

    /// The workflow catalog has no entry for the reference.
    #[error("workflow '{reference}' not found")]
    WorkflowNotFound { reference: String },

    /// A transient HTTP failure: network I/O, timeout at the transport
    /// layer, `5xx`, `408`, or `429`. Subject to the retry policy.
    #[error("retriable HTTP failure{}: {message}", format_status(.status))]
    HttpRetriable {
        status: Option<u16>,
        message: String,
        body: Option<Value>,
    },

    /// A permanent HTTP failure (`4xx` other than 408/429). Never retried.
    #[error("HTTP request failed{}: {message}", format_status(.status))]
    HttpFatal {
        status: Option<u16>,
        message: String,
        body: Option<Value>,
    },

    /// The circuit breaker rejected the call without invoking the
    /// executor.
    #[error("circuit '{key}' is open")]
    CircuitOpen { key: String },

    /// A per-step or per-workflow deadline elapsed.
    #[error("timed out: {message}")]
    Timeout { message: String },

    /// The caller cancelled the execution.
    #[error("execution cancelled")]
    Cancelled,

    /// A sub-workflow invocation would re-enter a workflow already on the
    /// call chain.
    #[error("workflow cycle detected: {}", .path.join(" -> "))]
    WorkflowCycle { path: Vec<String> },

    /// The sub-workflow call chain exceeded the configured depth limit.
    #[error("workflow call depth {depth} exceeds maximum {max_depth}")]
    WorkflowDepthExceeded { depth: usize, max_depth: usize },

    /// Failed to serialize or deserialize a JSON value.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Infrastructure failure (circuit or cache store unreachable).
    /// Programmer errors and resource exhaustion also land here.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Stable discriminator for the wire. Collaborators match on this,
    /// never on display text.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::SchemaInvalid { .. } => "schema-invalid",
            EngineError::ValidationFailed { .. } | EngineError::InvalidTask { .. } => {
                "validation-failed"
            }
            EngineError::TemplateMalformed { .. } => "template-malformed",
            EngineError::TemplateMissing { .. } => "template-missing",
            EngineError::DuplicateId { .. } => "duplicate-id",
            EngineError::UnknownDependency { .. } => "unknown-dep",
            EngineError::CircularDependency { .. } => "circular-dependency",
            EngineError::TypeIncompatible { .. } => "type-incompatible",
            EngineError::TaskNotFound { .. } => "task-not-found",
            EngineError::WorkflowNotFound { .. } => "workflow-not-found",
            EngineError::HttpRetriable { .. } => "http-retriable",
            EngineError::HttpFatal { .. } => "http-fatal",
            EngineError::CircuitOpen { .. } => "circuit-open",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Cancelled => "cancelled",
            EngineError::WorkflowCycle { .. } => "workflow-cycle",
            EngineError::WorkflowDepthExceeded { .. } => "workflow-depth-exceeded",
            EngineError::Serialization { .. } => "serialization",
            EngineError::Internal { .. } => "internal",
        }
    }

    /// Whether the retry policy may re-attempt after this failure.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            EngineError::HttpRetriable { .. } | EngineError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization {
            message: error.to_string(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            EngineError::Timeout {
                message: error.to_string(),
            }
        } else {
            // Connection and protocol failures are transient by default;
            // status-bearing failures are classified by the executor.
            EngineError::HttpRetriable {
                status: error.status().map(|s| s.as_u16()),
                message: error.to_string(),
                body: None,
            }
        }
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for EngineError {
    fn from(error: redis::RedisError) -> Self {
        EngineError::Internal {
            message: format!("redis: {}", error),
        }
    }
}

/// Wire-level rendering of an [`EngineError`], embedded in step results
/// and execution results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&EngineError> for ErrorDetail {
    fn from(error: &EngineError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {})", code),
        None => String::new(),
    }
}
