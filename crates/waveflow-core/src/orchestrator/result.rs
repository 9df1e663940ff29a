//! Machine-readable execution artifacts: validation reports, per-step
//! results, and the execution result envelope collaborators serialize
//! onto the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::CallStack;
use crate::error::{EngineError, ErrorDetail};
use crate::model::Step;

/// Terminal state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    /// Not executed: an earlier failure aborted the run, or this was a
    /// dry run.
    Skipped,
    Cancelled,
}

/// Diagnostics for one step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub from_cache: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_task_ref: Option<String>,
    /// Dry runs record the template-resolved input instead of invoking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_input: Option<Value>,
}

impl StepResult {
    pub(crate) fn pending(step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            task_ref: step.task_ref.clone(),
            workflow_ref: step.workflow_ref.clone(),
            status: StepStatus::Failed,
            output: None,
            error: None,
            attempts: 0,
            duration_ms: 0,
            from_cache: false,
            used_fallback: false,
            fallback_task_ref: None,
            resolved_input: None,
        }
    }

    pub(crate) fn unreached(step: &Step, status: StepStatus) -> Self {
        let mut result = Self::pending(step);
        result.status = status;
        result
    }
}

/// Result of one workflow execution. Always returned; expected error
/// classes never cross the API boundary as panics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub success: bool,
    pub output: Value,
    pub steps: Vec<StepResult>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_build_duration_micros: Option<u64>,
    /// The execution plan, included on dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<crate::graph::ExecutionGraph>,
    /// First failure in declaration order; each failing step also carries
    /// its own error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// One finding from [`Orchestrator::validate`](super::Orchestrator::validate).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Stable error kind (`duplicate-id`, `type-incompatible`, ...).
    pub kind: String,
    pub message: String,
}

impl ValidationIssue {
    pub(crate) fn from_error(step_id: Option<&str>, error: &EngineError) -> Self {
        Self {
            step_id: step_id.map(str::to_string),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Outcome of validating a workflow against the available catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

/// Per-execution knobs.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Whole-workflow deadline; cancels the execution when it elapses.
    pub timeout: Option<Duration>,
    /// Cap on concurrently running steps, below the wave width.
    pub max_concurrency: Option<usize>,
    /// Validate, plan, and resolve templates without issuing requests.
    pub dry_run: bool,
    /// Fail output resolution on missing task outputs instead of
    /// producing `null`.
    pub strict_output: bool,
    /// Call chain inherited from a parent execution.
    pub call_stack: Option<CallStack>,
    /// Cooperative cancellation signal from the caller.
    pub cancellation: Option<CancellationToken>,
}
