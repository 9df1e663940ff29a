//! Validation and planning through the public API: catalog references,
//! dataflow type compatibility, and the plan/execute contract for
//! invalid specs.

use std::sync::Arc;

use serde_json::json;

use waveflow_core::error::circuit_breaker::{CircuitBreaker, InMemoryCircuitStore};
use waveflow_core::executor::cache::InMemoryCache;
use waveflow_core::model::{HttpMethod, StepBuilder, TaskDocument, WorkflowBuilder};
use waveflow_core::orchestrator::{ExecutionOptions, Orchestrator};
use waveflow_core::registry::InMemoryResolver;
use waveflow_core::testing::{http_task, MockHttpExecutor};

fn harness() -> (Orchestrator, Arc<MockHttpExecutor>, Arc<InMemoryResolver>) {
    let resolver = Arc::new(InMemoryResolver::new());
    let http = Arc::new(MockHttpExecutor::new());
    let orchestrator = Orchestrator::new(
        resolver.clone(),
        http.clone(),
        Arc::new(InMemoryCache::new()),
        Arc::new(CircuitBreaker::new(Arc::new(InMemoryCircuitStore::new()))),
    );
    (orchestrator, http, resolver)
}

fn with_schemas(mut task: TaskDocument, input: serde_json::Value, output: serde_json::Value) -> TaskDocument {
    task.spec.input_schema = Some(serde_json::from_value(input).unwrap());
    task.spec.output_schema = Some(serde_json::from_value(output).unwrap());
    task
}

#[tokio::test]
async fn a_well_formed_workflow_validates_cleanly() {
    let (orchestrator, _http, resolver) = harness();

    let producer = with_schemas(
        http_task("producer", HttpMethod::GET, "http://svc/p"),
        json!({"type": "object"}),
        json!({"type": "object", "properties": {"id": {"type": "integer"}}}),
    );
    let consumer = with_schemas(
        http_task("consumer", HttpMethod::POST, "http://svc/c"),
        json!({"type": "object", "properties": {"id": {"type": "integer"}}}),
        json!({"type": "object"}),
    );
    resolver.register_task(producer).unwrap();
    resolver.register_task(consumer).unwrap();

    let workflow = WorkflowBuilder::new("ok")
        .step(StepBuilder::new("p").task_ref("producer").build())
        .step(
            StepBuilder::new("c")
                .task_ref("consumer")
                .input("id", "{{tasks.p.output.id}}")
                .build(),
        )
        .build();

    let report = orchestrator.validate(&workflow).await;
    assert!(report.valid, "unexpected issues: {:?}", report.issues);
}

#[tokio::test]
async fn unknown_task_references_are_reported() {
    let (orchestrator, _http, _resolver) = harness();

    let workflow = WorkflowBuilder::new("missing")
        .step(StepBuilder::new("s").task_ref("nowhere").build())
        .build();

    let report = orchestrator.validate(&workflow).await;
    assert!(!report.valid);
    assert_eq!(report.issues[0].kind, "task-not-found");
    assert_eq!(report.issues[0].step_id.as_deref(), Some("s"));
}

#[tokio::test]
async fn mismatched_dataflow_types_are_incompatible() {
    let (orchestrator, _http, resolver) = harness();

    let producer = with_schemas(
        http_task("producer", HttpMethod::GET, "http://svc/p"),
        json!({"type": "object"}),
        json!({"type": "object", "properties": {"id": {"type": "string"}}}),
    );
    let consumer = with_schemas(
        http_task("consumer", HttpMethod::POST, "http://svc/c"),
        json!({"type": "object", "properties": {"id": {"type": "integer"}}}),
        json!({"type": "object"}),
    );
    resolver.register_task(producer).unwrap();
    resolver.register_task(consumer).unwrap();

    let workflow = WorkflowBuilder::new("mismatch")
        .step(StepBuilder::new("p").task_ref("producer").build())
        .step(
            StepBuilder::new("c")
                .task_ref("consumer")
                .input("id", "{{tasks.p.output.id}}")
                .build(),
        )
        .build();

    let report = orchestrator.validate(&workflow).await;
    assert!(!report.valid);
    assert_eq!(report.issues[0].kind, "type-incompatible");
    assert!(report.issues[0].message.contains("expected integer"));
    assert!(report.issues[0].message.contains("found string"));
}

#[tokio::test]
async fn fields_absent_from_the_producer_schema_are_incompatible() {
    let (orchestrator, _http, resolver) = harness();

    let producer = with_schemas(
        http_task("producer", HttpMethod::GET, "http://svc/p"),
        json!({"type": "object"}),
        json!({"type": "object", "properties": {"name": {"type": "string"}}}),
    );
    let consumer = with_schemas(
        http_task("consumer", HttpMethod::POST, "http://svc/c"),
        json!({"type": "object", "properties": {"email": {"type": "string"}}}),
        json!({"type": "object"}),
    );
    resolver.register_task(producer).unwrap();
    resolver.register_task(consumer).unwrap();

    let workflow = WorkflowBuilder::new("absent-field")
        .step(StepBuilder::new("p").task_ref("producer").build())
        .step(
            StepBuilder::new("c")
                .task_ref("consumer")
                .input("email", "{{tasks.p.output.email}}")
                .build(),
        )
        .build();

    let report = orchestrator.validate(&workflow).await;
    assert!(!report.valid);
    assert_eq!(report.issues[0].kind, "type-incompatible");
    assert!(report.issues[0].message.contains("found nothing"));
}

#[tokio::test]
async fn steps_with_both_targets_fail_validation() {
    let (orchestrator, _http, resolver) = harness();

    resolver
        .register_task(http_task("t", HttpMethod::GET, "http://svc/t"))
        .unwrap();

    let workflow = WorkflowBuilder::new("double")
        .step(
            StepBuilder::new("s")
                .task_ref("t")
                .workflow_ref("w")
                .build(),
        )
        .build();

    let report = orchestrator.validate(&workflow).await;
    assert!(!report.valid);
    assert!(report
        .issues
        .iter()
        .any(|i| i.message.contains("both taskRef and workflowRef")));
}

#[tokio::test]
async fn missing_fallback_tasks_are_reported() {
    let (orchestrator, _http, resolver) = harness();

    resolver
        .register_task(http_task("t", HttpMethod::GET, "http://svc/t"))
        .unwrap();

    let workflow = WorkflowBuilder::new("fallback-missing")
        .step(
            StepBuilder::new("s")
                .task_ref("t")
                .fallback("ghost")
                .build(),
        )
        .build();

    let report = orchestrator.validate(&workflow).await;
    assert!(!report.valid);
    assert_eq!(report.issues[0].kind, "task-not-found");
}

#[tokio::test]
async fn executing_an_invalid_spec_fails_without_any_call() {
    let (orchestrator, http, resolver) = harness();

    resolver
        .register_task(http_task("t", HttpMethod::GET, "http://svc/t"))
        .unwrap();

    let workflow = WorkflowBuilder::new("bad-dep")
        .step(StepBuilder::new("s").task_ref("t").depends_on("ghost").build())
        .build();

    let result = orchestrator
        .execute(&workflow, json!({}), ExecutionOptions::default())
        .await;

    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, "unknown-dep");
    assert!(result.steps.is_empty());
    assert_eq!(http.outbound_calls(), 0);
}

#[tokio::test]
async fn planning_reports_cycles_through_the_api() {
    let (orchestrator, _http, resolver) = harness();

    resolver
        .register_task(http_task("t", HttpMethod::GET, "http://svc/t"))
        .unwrap();

    let workflow = WorkflowBuilder::new("cyclic")
        .step(StepBuilder::new("a").task_ref("t").depends_on("b").build())
        .step(StepBuilder::new("b").task_ref("t").depends_on("a").build())
        .build();

    let errors = orchestrator.plan(&workflow).unwrap_err();
    assert_eq!(errors[0].kind(), "circular-dependency");

    let report = orchestrator.validate(&workflow).await;
    assert!(!report.valid);
    assert!(report.issues.iter().any(|i| i.kind == "circular-dependency"));
}
