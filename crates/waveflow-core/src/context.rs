//! Execution context and the sub-workflow call stack.
//!
//! The context is the per-run mapping templates resolve against:
//! `{input, tasks: {<stepId>: {output}}}`. The `input` entry is immutable
//! for the duration of an execution; step outputs are appended exactly
//! once, by a single writer per step id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Default maximum length of a sub-workflow call chain.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 5;

/// Per-execution state: the workflow input plus the accumulating
/// `tasks.<id>.output` map.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    /// Execution this context was forked from, for sub-workflow runs.
    pub parent_execution_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    input: Value,
    tasks: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(input: Value) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            parent_execution_id: None,
            started_at: Utc::now(),
            input,
            tasks: HashMap::new(),
        }
    }

    /// A fresh context for a sub-workflow: the resolved step input becomes
    /// the child's `input`, and the `tasks` map starts empty. Parent
    /// outputs are not visible inside the child.
    pub fn child(&self, input: Value) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            parent_execution_id: Some(self.execution_id),
            started_at: Utc::now(),
            input,
            tasks: HashMap::new(),
        }
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Record a completed step's output. The first write wins; a second
    /// write for the same id indicates a scheduler bug and is dropped.
    pub fn record_output(&mut self, step_id: &str, output: Value) {
        if self.tasks.contains_key(step_id) {
            tracing::warn!(step_id, "duplicate output write ignored");
            return;
        }
        self.tasks.insert(step_id.to_string(), output);
    }

    pub fn task_output(&self, step_id: &str) -> Option<&Value> {
        self.tasks.get(step_id)
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.tasks
    }

    pub fn lookup_input(&self, path: &[String]) -> Option<&Value> {
        walk(&self.input, path)
    }

    pub fn lookup_task_output(&self, step_id: &str, path: &[String]) -> Option<&Value> {
        walk(self.tasks.get(step_id)?, path)
    }
}

fn walk<'a>(mut value: &'a Value, path: &[String]) -> Option<&'a Value> {
    for key in path {
        value = value.get(key)?;
    }
    Some(value)
}

/// Ordered list of workflow names currently executing along one
/// invocation chain. Guards sub-workflow recursion against cycles and
/// unbounded depth.
#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<String>,
    max_depth: usize,
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALL_DEPTH)
    }
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Push a workflow onto the chain, failing with `workflow-cycle` when
    /// the name is already present (the reported path runs from the first
    /// visit back to the repeat) or `workflow-depth-exceeded` past the
    /// depth limit. Returns a new stack so sibling branches stay
    /// independent.
    pub fn push(&self, workflow: &str) -> Result<CallStack> {
        if let Some(position) = self.frames.iter().position(|frame| frame == workflow) {
            let mut path: Vec<String> = self.frames[position..].to_vec();
            path.push(workflow.to_string());
            return Err(EngineError::WorkflowCycle { path });
        }
        let depth = self.frames.len() + 1;
        if depth > self.max_depth {
            return Err(EngineError::WorkflowDepthExceeded {
                depth,
                max_depth: self.max_depth,
            });
        }
        let mut next = self.clone();
        next.frames.push(workflow.to_string());
        Ok(next)
    }
}
