//! Fluent construction of workflow documents, for embedding the engine
//! and for tests. Builders stamp the current [`API_VERSION`](super::API_VERSION)
//! and the right `kind`.

use std::collections::BTreeMap;

use super::{
    Metadata, Step, WorkflowDocument, WorkflowSpec, API_VERSION, WORKFLOW_KIND,
};
use crate::error::circuit_breaker::CircuitBreakerConfig;
use crate::error::retry::RetryPolicy;
use crate::executor::cache::CacheConfig;
use crate::schema::Schema;

/// Builder for [`WorkflowDocument`]s.
pub struct WorkflowBuilder {
    metadata: Metadata,
    input: Option<Schema>,
    output: BTreeMap<String, String>,
    steps: Vec<Step>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::named(name),
            input: None,
            output: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = Some(namespace.into());
        self
    }

    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input = Some(schema);
        self
    }

    /// Add one field to the workflow output mapping.
    pub fn output(mut self, field: impl Into<String>, template: impl Into<String>) -> Self {
        self.output.insert(field.into(), template.into());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> WorkflowDocument {
        WorkflowDocument {
            api_version: API_VERSION.to_string(),
            kind: WORKFLOW_KIND.to_string(),
            metadata: self.metadata,
            spec: WorkflowSpec {
                input: self.input,
                output: self.output,
                tasks: self.steps,
            },
        }
    }
}

/// Builder for [`Step`]s.
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            step: Step {
                id: id.into(),
                task_ref: None,
                workflow_ref: None,
                depends_on: Vec::new(),
                input: BTreeMap::new(),
                retry: None,
                cache: None,
                circuit: None,
                fallback: None,
                timeout_ms: None,
            },
        }
    }

    pub fn task_ref(mut self, reference: impl Into<String>) -> Self {
        self.step.task_ref = Some(reference.into());
        self
    }

    pub fn workflow_ref(mut self, reference: impl Into<String>) -> Self {
        self.step.workflow_ref = Some(reference.into());
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.step.depends_on.push(step_id.into());
        self
    }

    pub fn input(mut self, parameter: impl Into<String>, template: impl Into<String>) -> Self {
        self.step.input.insert(parameter.into(), template.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.step.retry = Some(policy);
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.step.cache = Some(cache);
        self
    }

    pub fn circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.step.circuit = Some(circuit);
        self
    }

    pub fn fallback(mut self, task_ref: impl Into<String>) -> Self {
        self.step.fallback = Some(task_ref.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn build(self) -> Step {
        self.step
    }
}
