//! Declarative, Kubernetes-style documents: reusable `WorkflowTask`s and
//! `Workflow` DAGs. Wire names are camelCase; documents parse from YAML
//! or JSON with kind checking. Once accepted, documents are read-only.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::circuit_breaker::CircuitBreakerConfig;
use crate::error::retry::RetryPolicy;
use crate::error::{EngineError, Result};
use crate::executor::cache::CacheConfig;
use crate::schema::Schema;

pub mod builder;

pub use builder::{StepBuilder, WorkflowBuilder};

/// `apiVersion` stamped on documents built programmatically.
pub const API_VERSION: &str = "waveflow.io/v1";
/// `kind` of a reusable task document.
pub const TASK_KIND: &str = "WorkflowTask";
/// `kind` of a workflow document.
pub const WORKFLOW_KIND: &str = "Workflow";

/// What a task does when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Http,
    Transform,
    #[serde(rename = "subworkflow")]
    SubWorkflow,
}

/// HTTP methods a task may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
        };
        f.write_str(name)
    }
}

/// Object metadata: `name` is cluster-unique within a kind; `namespace`
/// is optional. Resolution keys are case-sensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Metadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// `namespace/name` when namespaced, bare `name` otherwise.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}/{}", namespace, self.name),
            None => self.name.clone(),
        }
    }
}

/// The request shape of an HTTP task. URL, header values, and body
/// strings are templates resolved against the task's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestSpec {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A transform task's payload: an output mapping rendered against the
/// task's resolved input. No network I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub output: BTreeMap<String, String>,
}

/// The `spec` of a `WorkflowTask` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequestSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformSpec>,
    /// Target workflow for `type: subworkflow` tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// A reusable task document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: TaskSpec,
}

impl TaskDocument {
    pub fn from_yaml(source: &str) -> Result<Self> {
        let document: Self =
            serde_yaml::from_str(source).map_err(|e| EngineError::Serialization {
                message: format!("task document: {}", e),
            })?;
        document.check_kind()?;
        Ok(document)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        let document: Self = serde_json::from_str(source)?;
        document.check_kind()?;
        Ok(document)
    }

    fn check_kind(&self) -> Result<()> {
        if self.kind != TASK_KIND {
            return Err(EngineError::InvalidTask {
                reference: self.metadata.qualified_name(),
                message: format!("expected kind '{}', found '{}'", TASK_KIND, self.kind),
            });
        }
        Ok(())
    }

    /// Structural invariants that schema validation cannot express.
    pub fn validate_structure(&self) -> Result<()> {
        let reference = self.metadata.qualified_name();
        match self.spec.kind {
            TaskKind::Http => {
                let url_present = self
                    .spec
                    .request
                    .as_ref()
                    .map(|r| !r.url.trim().is_empty())
                    .unwrap_or(false);
                if !url_present {
                    return Err(EngineError::InvalidTask {
                        reference,
                        message: "HTTP tasks must declare a request URL".to_string(),
                    });
                }
            }
            TaskKind::Transform => {
                if self.spec.transform.is_none() {
                    return Err(EngineError::InvalidTask {
                        reference,
                        message: "transform tasks must declare an output mapping".to_string(),
                    });
                }
            }
            TaskKind::SubWorkflow => {
                if self.spec.workflow.is_none() {
                    return Err(EngineError::InvalidTask {
                        reference,
                        message: "subworkflow tasks must name a target workflow".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// One step of a workflow: an instance of a task (or a nested workflow)
/// with its dataflow wiring and resilience overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// What a step invokes: exactly one of `taskRef` or `workflowRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTarget<'a> {
    Task(&'a str),
    Workflow(&'a str),
}

impl Step {
    pub fn target(&self) -> Result<StepTarget<'_>> {
        match (&self.task_ref, &self.workflow_ref) {
            (Some(task), None) => Ok(StepTarget::Task(task)),
            (None, Some(workflow)) => Ok(StepTarget::Workflow(workflow)),
            (Some(_), Some(_)) => Err(EngineError::InvalidTask {
                reference: self.id.clone(),
                message: "step declares both taskRef and workflowRef".to_string(),
            }),
            (None, None) => Err(EngineError::InvalidTask {
                reference: self.id.clone(),
                message: "step declares neither taskRef nor workflowRef".to_string(),
            }),
        }
    }
}

/// The `spec` of a `Workflow` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Schema>,
    /// Workflow output mapping: `field -> template`, resolved against the
    /// final context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output: BTreeMap<String, String>,
    /// Ordered steps; declaration order is the scheduling tie-break.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Step>,
}

/// A workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDocument {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: WorkflowSpec,
}

impl WorkflowDocument {
    pub fn from_yaml(source: &str) -> Result<Self> {
        let document: Self =
            serde_yaml::from_str(source).map_err(|e| EngineError::Serialization {
                message: format!("workflow document: {}", e),
            })?;
        document.check_kind()?;
        Ok(document)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        let document: Self = serde_json::from_str(source)?;
        document.check_kind()?;
        Ok(document)
    }

    fn check_kind(&self) -> Result<()> {
        if self.kind != WORKFLOW_KIND {
            return Err(EngineError::InvalidTask {
                reference: self.metadata.qualified_name(),
                message: format!("expected kind '{}', found '{}'", WORKFLOW_KIND, self.kind),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK_YAML: &str = r#"
apiVersion: waveflow.io/v1
kind: WorkflowTask
metadata:
  name: fetch-user
  namespace: identity
spec:
  type: http
  inputSchema:
    type: object
    required: [userId]
    properties:
      userId: {type: string}
  outputSchema:
    type: object
    properties:
      name: {type: string}
  request:
    method: GET
    url: "https://users.internal/v1/{{input.userId}}"
    headers:
      Accept: application/json
  retry:
    maxAttempts: 3
    initialDelayMs: 10
  cache:
    ttlSeconds: 60
"#;

    const WORKFLOW_YAML: &str = r#"
apiVersion: waveflow.io/v1
kind: Workflow
metadata:
  name: enrich-user
spec:
  input:
    type: object
    required: [userId]
    properties:
      userId: {type: string}
  output:
    profile: "{{tasks.fetch.output}}"
  tasks:
    - id: fetch
      taskRef: identity/fetch-user
      input:
        userId: "{{input.userId}}"
    - id: notify
      taskRef: notify-ops
      dependsOn: [fetch]
      input:
        name: "{{tasks.fetch.output.name}}"
"#;

    #[test]
    fn task_documents_parse_from_yaml() {
        let task = TaskDocument::from_yaml(TASK_YAML).unwrap();
        assert_eq!(task.metadata.qualified_name(), "identity/fetch-user");
        assert_eq!(task.spec.kind, TaskKind::Http);
        let request = task.spec.request.as_ref().unwrap();
        assert_eq!(request.method, HttpMethod::GET);
        assert_eq!(task.spec.retry.as_ref().unwrap().max_attempts, 3);
        task.validate_structure().unwrap();
    }

    #[test]
    fn workflow_documents_parse_from_yaml() {
        let workflow = WorkflowDocument::from_yaml(WORKFLOW_YAML).unwrap();
        assert_eq!(workflow.metadata.name, "enrich-user");
        assert_eq!(workflow.spec.tasks.len(), 2);
        assert_eq!(workflow.spec.tasks[1].depends_on, vec!["fetch"]);
        assert_eq!(
            workflow.spec.tasks[0].target().unwrap(),
            StepTarget::Task("identity/fetch-user")
        );
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let wrong_kind = TASK_YAML.replace("kind: WorkflowTask", "kind: Task");
        let error = TaskDocument::from_yaml(&wrong_kind).unwrap_err();
        assert_eq!(error.kind(), "validation-failed");
        assert!(error.to_string().contains("expected kind 'WorkflowTask'"));
    }

    #[test]
    fn http_tasks_without_url_fail_structure_checks() {
        let mut task = TaskDocument::from_yaml(TASK_YAML).unwrap();
        task.spec.request = None;
        let error = task.validate_structure().unwrap_err();
        assert_eq!(error.kind(), "validation-failed");
    }

    #[test]
    fn steps_need_exactly_one_target() {
        let mut step = Step {
            id: "s".into(),
            task_ref: None,
            workflow_ref: None,
            depends_on: Vec::new(),
            input: BTreeMap::new(),
            retry: None,
            cache: None,
            circuit: None,
            fallback: None,
            timeout_ms: None,
        };
        assert!(step.target().is_err());
        step.task_ref = Some("t".into());
        step.workflow_ref = Some("w".into());
        assert!(step.target().is_err());
        step.workflow_ref = None;
        assert_eq!(step.target().unwrap(), StepTarget::Task("t"));
    }
}
