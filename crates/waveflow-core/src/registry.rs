//! Catalog contract bridging the engine to wherever task and workflow
//! documents actually live (cluster API, database, files). The engine
//! only ever sees [`TaskResolver`]; [`InMemoryResolver`] serves embedded
//! use and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::model::{TaskDocument, WorkflowDocument};

/// Lookup by `name` or `namespace/name`; resolution is case-sensitive.
#[async_trait]
pub trait TaskResolver: Send + Sync {
    async fn get_task(&self, reference: &str) -> Result<Option<TaskDocument>>;
    async fn get_workflow(&self, reference: &str) -> Result<Option<WorkflowDocument>>;
}

/// In-memory catalog keyed by qualified name.
#[derive(Default)]
pub struct InMemoryResolver {
    tasks: RwLock<HashMap<String, TaskDocument>>,
    workflows: RwLock<HashMap<String, WorkflowDocument>>,
}

impl InMemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task(&self, task: TaskDocument) -> Result<()> {
        let key = task.metadata.qualified_name();
        let mut tasks = self.tasks.write().unwrap();
        if tasks.contains_key(&key) {
            return Err(EngineError::InvalidTask {
                reference: key,
                message: "task is already registered".to_string(),
            });
        }
        tasks.insert(key, task);
        Ok(())
    }

    pub fn register_workflow(&self, workflow: WorkflowDocument) -> Result<()> {
        let key = workflow.metadata.qualified_name();
        let mut workflows = self.workflows.write().unwrap();
        if workflows.contains_key(&key) {
            return Err(EngineError::InvalidTask {
                reference: key,
                message: "workflow is already registered".to_string(),
            });
        }
        workflows.insert(key, workflow);
        Ok(())
    }
}

#[async_trait]
impl TaskResolver for InMemoryResolver {
    async fn get_task(&self, reference: &str) -> Result<Option<TaskDocument>> {
        Ok(self.tasks.read().unwrap().get(reference).cloned())
    }

    async fn get_workflow(&self, reference: &str) -> Result<Option<WorkflowDocument>> {
        Ok(self.workflows.read().unwrap().get(reference).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, TaskKind, TaskSpec, TaskDocument, API_VERSION, TASK_KIND};

    fn task(name: &str, namespace: Option<&str>) -> TaskDocument {
        TaskDocument {
            api_version: API_VERSION.to_string(),
            kind: TASK_KIND.to_string(),
            metadata: Metadata {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
            },
            spec: TaskSpec {
                kind: TaskKind::Transform,
                input_schema: None,
                output_schema: None,
                request: None,
                transform: None,
                workflow: None,
                retry: None,
                cache: None,
                circuit: None,
                fallback: None,
            },
        }
    }

    #[tokio::test]
    async fn resolution_is_by_qualified_name_and_case_sensitive() {
        let resolver = InMemoryResolver::new();
        resolver.register_task(task("fetch", None)).unwrap();
        resolver.register_task(task("fetch", Some("billing"))).unwrap();

        assert!(resolver.get_task("fetch").await.unwrap().is_some());
        assert!(resolver.get_task("billing/fetch").await.unwrap().is_some());
        assert!(resolver.get_task("Fetch").await.unwrap().is_none());
        assert!(resolver.get_task("other/fetch").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let resolver = InMemoryResolver::new();
        resolver.register_task(task("fetch", None)).unwrap();
        let error = resolver.register_task(task("fetch", None)).unwrap_err();
        assert_eq!(error.kind(), "validation-failed");
    }
}
