//! # Orchestrator
//!
//! Drives a workflow end-to-end: validation against the catalog, graph
//! planning, wave-by-wave scheduling, template-driven dataflow, and the
//! per-step resilience pipeline (cache, circuit breaker, retry,
//! fallback, sub-workflow isolation).
//!
//! ## Scheduling model
//!
//! Execution is wave-by-wave: within a wave every step is eligible at
//! once and runs concurrently (optionally capped by `max_concurrency`);
//! wave `n + 1` does not begin until every step in wave `n` reached a
//! terminal state. Every reader in a later wave therefore sees every
//! writer in earlier waves, which is the whole correctness model for
//! template dataflow.
//!
//! ## Per-step pipeline
//!
//! 1. Resolve the step's input templates against the current context.
//! 2. Validate the resolved input against the task's input schema.
//! 3. Consult the response cache (eligible methods only).
//! 4. Consult the circuit breaker; an open circuit routes to fallback.
//! 5. Invoke through the HTTP executor with the merged retry policy, or
//!    recurse into a sub-workflow for `workflowRef` steps.
//! 6. Record the output in the context, update circuit statistics, store
//!    cache entries, or run the fallback task once on failure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{join_all, BoxFuture};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{CallStack, ExecutionContext};
use crate::error::circuit_breaker::{CircuitBreaker, CircuitDecision};
use crate::error::retry::retry_with_policy;
use crate::error::{EngineError, ErrorDetail, Result};
use crate::executor::cache::{cache_key, CacheProvider, CachedResponse};
use crate::executor::http::{HttpExecutor, HttpTaskRequest};
use crate::graph::ExecutionGraph;
use crate::model::{
    HttpRequestSpec, Step, StepTarget, TaskDocument, TaskKind, WorkflowDocument,
};
use crate::registry::TaskResolver;
use crate::schema::{self, Schema};
use crate::template::{Template, TemplateExpr};

mod result;

pub use result::{
    ExecutionOptions, ExecutionResult, StepResult, StepStatus, ValidationIssue, ValidationReport,
};

/// The workflow execution engine. Capabilities are injected at
/// composition time; one instance serves many concurrent executions.
pub struct Orchestrator {
    resolver: Arc<dyn TaskResolver>,
    http: Arc<dyn HttpExecutor>,
    cache: Arc<dyn CacheProvider>,
    breaker: Arc<CircuitBreaker>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<dyn TaskResolver>,
        http: Arc<dyn HttpExecutor>,
        cache: Arc<dyn CacheProvider>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            resolver,
            http,
            cache,
            breaker,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The breaker, for the operator admin surface.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Build the execution plan without running anything.
    pub fn plan(
        &self,
        workflow: &WorkflowDocument,
    ) -> std::result::Result<ExecutionGraph, Vec<EngineError>> {
        ExecutionGraph::build(&workflow.spec.tasks)
    }

    /// Validate a workflow against the available catalog: structure,
    /// references, templates, the dependency graph, and type
    /// compatibility across dataflow edges.
    #[tracing::instrument(skip_all, fields(workflow = %workflow.metadata.qualified_name()))]
    pub async fn validate(&self, workflow: &WorkflowDocument) -> ValidationReport {
        let mut issues = Vec::new();

        if let Err(errors) = ExecutionGraph::build(&workflow.spec.tasks) {
            for error in &errors {
                issues.push(ValidationIssue::from_error(None, error));
            }
        }

        for step in &workflow.spec.tasks {
            match step.target() {
                Err(error) => issues.push(ValidationIssue::from_error(Some(&step.id), &error)),
                Ok(StepTarget::Task(reference)) => match self.resolver.get_task(reference).await {
                    Ok(Some(task)) => {
                        if let Err(error) = task.validate_structure() {
                            issues.push(ValidationIssue::from_error(Some(&step.id), &error));
                        }
                        self.check_dataflow(workflow, step, &task, &mut issues).await;
                    }
                    Ok(None) => issues.push(ValidationIssue::from_error(
                        Some(&step.id),
                        &EngineError::TaskNotFound {
                            reference: reference.to_string(),
                        },
                    )),
                    Err(error) => {
                        issues.push(ValidationIssue::from_error(Some(&step.id), &error))
                    }
                },
                Ok(StepTarget::Workflow(reference)) => {
                    match self.resolver.get_workflow(reference).await {
                        Ok(Some(_)) => {}
                        Ok(None) => issues.push(ValidationIssue::from_error(
                            Some(&step.id),
                            &EngineError::WorkflowNotFound {
                                reference: reference.to_string(),
                            },
                        )),
                        Err(error) => {
                            issues.push(ValidationIssue::from_error(Some(&step.id), &error))
                        }
                    }
                }
            }

            if let Some(reference) = &step.fallback {
                match self.resolver.get_task(reference).await {
                    Ok(Some(_)) => {}
                    Ok(None) => issues.push(ValidationIssue::from_error(
                        Some(&step.id),
                        &EngineError::TaskNotFound {
                            reference: reference.to_string(),
                        },
                    )),
                    Err(error) => {
                        issues.push(ValidationIssue::from_error(Some(&step.id), &error))
                    }
                }
            }
        }

        for source in workflow.spec.output.values() {
            if let Err(error) = Template::parse(source) {
                issues.push(ValidationIssue::from_error(None, &error));
            }
        }

        ValidationReport {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// Execute a workflow to completion and return the result envelope.
    /// Expected error classes are reported inside the result, never
    /// thrown.
    #[tracing::instrument(skip(self, input, options), fields(workflow = %workflow.metadata.qualified_name()))]
    pub async fn execute(
        &self,
        workflow: &WorkflowDocument,
        input: Value,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let cancel = match &options.cancellation {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        let timed_out = Arc::new(AtomicBool::new(false));
        if let Some(timeout) = options.timeout {
            let watchdog_cancel = cancel.clone();
            let flag = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                flag.store(true, Ordering::SeqCst);
                watchdog_cancel.cancel();
            });
        }

        let stack = options
            .call_stack
            .clone()
            .unwrap_or_else(|| CallStack::new(self.config.max_depth));

        let mut result = self
            .run_workflow(workflow, ExecutionContext::new(input), &stack, &options, &cancel)
            .await;

        if timed_out.load(Ordering::SeqCst) {
            if let Some(error) = &result.error {
                if error.kind == "cancelled" {
                    result.error = Some(ErrorDetail::new(
                        "timeout",
                        format!(
                            "workflow timed out after {}ms",
                            options.timeout.unwrap_or_default().as_millis()
                        ),
                    ));
                }
            }
        }
        result
    }

    /// One nesting level of execution over a pre-built context: the root
    /// context from [`execute`](Self::execute), or a child context forked
    /// by a sub-workflow step. Boxed so sub-workflow steps can recurse
    /// through it.
    fn run_workflow<'a>(
        &'a self,
        workflow: &'a WorkflowDocument,
        mut ctx: ExecutionContext,
        stack: &'a CallStack,
        options: &'a ExecutionOptions,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ExecutionResult> {
        Box::pin(async move {
            let run_started = Instant::now();

            let stack = match stack.push(&workflow.metadata.qualified_name()) {
                Ok(stack) => stack,
                Err(error) => {
                    return early_failure(ctx.execution_id, (&error).into(), run_started, None)
                }
            };

            if let Some(input_schema) = &workflow.spec.input {
                match schema::validate(input_schema, ctx.input()) {
                    Ok(violations) if violations.is_empty() => {}
                    Ok(violations) => {
                        return early_failure(
                            ctx.execution_id,
                            (&EngineError::ValidationFailed { violations }).into(),
                            run_started,
                            None,
                        )
                    }
                    Err(error) => {
                        return early_failure(
                            ctx.execution_id,
                            (&error).into(),
                            run_started,
                            None,
                        )
                    }
                }
            }

            let report = self.validate(workflow).await;
            if !report.valid {
                let issue = &report.issues[0];
                return early_failure(
                    ctx.execution_id,
                    ErrorDetail::new(issue.kind.clone(), issue.message.clone()),
                    run_started,
                    None,
                );
            }

            let plan_started = Instant::now();
            let graph = match ExecutionGraph::build(&workflow.spec.tasks) {
                Ok(graph) => graph,
                Err(errors) => {
                    return early_failure(
                        ctx.execution_id,
                        (&errors[0]).into(),
                        run_started,
                        None,
                    );
                }
            };
            let graph_micros = plan_started.elapsed().as_micros() as u64;

            tracing::info!(
                execution_id = %ctx.execution_id,
                steps = workflow.spec.tasks.len(),
                waves = graph.waves.len(),
                dry_run = options.dry_run,
                "starting workflow execution"
            );

            let semaphore = options
                .max_concurrency
                .or(self.config.max_concurrency)
                .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

            let mut step_results: Vec<StepResult> =
                Vec::with_capacity(workflow.spec.tasks.len());
            let mut aborted: Option<StepStatus> = None;

            for wave in &graph.waves {
                if cancel.is_cancelled() {
                    aborted = Some(StepStatus::Cancelled);
                    break;
                }

                let futures: Vec<_> = wave
                    .iter()
                    .map(|&index| {
                        let step = &workflow.spec.tasks[index];
                        self.run_step(step, &ctx, &stack, options, cancel, semaphore.clone())
                    })
                    .collect();
                let wave_results = join_all(futures).await;

                let mut wave_failed = false;
                let mut wave_cancelled = false;
                for step_result in wave_results {
                    match step_result.status {
                        StepStatus::Success => {
                            if !options.dry_run {
                                ctx.record_output(
                                    &step_result.id,
                                    step_result.output.clone().unwrap_or(Value::Null),
                                );
                            }
                        }
                        StepStatus::Failed => wave_failed = true,
                        StepStatus::Cancelled => wave_cancelled = true,
                        StepStatus::Skipped => {}
                    }
                    step_results.push(step_result);
                }

                if wave_cancelled {
                    aborted = Some(StepStatus::Cancelled);
                    break;
                }
                if wave_failed {
                    aborted = Some(StepStatus::Skipped);
                    break;
                }
            }

            if let Some(status) = aborted {
                let executed: HashSet<String> =
                    step_results.iter().map(|r| r.id.clone()).collect();
                for step in &workflow.spec.tasks {
                    if !executed.contains(&step.id) {
                        step_results.push(StepResult::unreached(step, status));
                    }
                }
            }

            // Report steps in declaration order regardless of wave layout.
            let order: HashMap<&str, usize> = workflow
                .spec
                .tasks
                .iter()
                .enumerate()
                .map(|(index, step)| (step.id.as_str(), index))
                .collect();
            step_results
                .sort_by_key(|r| order.get(r.id.as_str()).copied().unwrap_or(usize::MAX));

            // First failure in declaration order becomes the top-level
            // error; every failing sibling keeps its own error in steps[].
            let mut error = step_results
                .iter()
                .find(|r| r.status == StepStatus::Failed)
                .and_then(|r| r.error.clone());
            if error.is_none()
                && step_results
                    .iter()
                    .any(|r| r.status == StepStatus::Cancelled)
            {
                error = Some(ErrorDetail::new(
                    "cancelled",
                    EngineError::Cancelled.to_string(),
                ));
            }

            let output = if error.is_none() {
                match resolve_output(&workflow.spec.output, &ctx, options.strict_output) {
                    Ok(value) => value,
                    Err(resolve_error) => {
                        return ExecutionResult {
                            execution_id: ctx.execution_id,
                            success: false,
                            output: Value::Null,
                            steps: step_results,
                            duration_ms: run_started.elapsed().as_millis() as u64,
                            graph_build_duration_micros: Some(graph_micros),
                            plan: options.dry_run.then(|| graph.clone()),
                            error: Some((&resolve_error).into()),
                        }
                    }
                }
            } else {
                Value::Null
            };

            let success = error.is_none();
            tracing::info!(
                execution_id = %ctx.execution_id,
                success,
                duration_ms = run_started.elapsed().as_millis() as u64,
                "workflow execution finished"
            );

            ExecutionResult {
                execution_id: ctx.execution_id,
                success,
                output,
                steps: step_results,
                duration_ms: run_started.elapsed().as_millis() as u64,
                graph_build_duration_micros: Some(graph_micros),
                plan: options.dry_run.then(|| graph.clone()),
                error,
            }
        })
    }

    async fn run_step(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        stack: &CallStack,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
        semaphore: Option<Arc<Semaphore>>,
    ) -> StepResult {
        let started = Instant::now();
        let _permit = match &semaphore {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };

        let mut result = StepResult::pending(step);
        if cancel.is_cancelled() {
            return finish_failed(result, &EngineError::Cancelled, started);
        }

        tracing::debug!(step = %step.id, "running step");

        let mut resolved = Map::new();
        for (parameter, source) in &step.input {
            match Template::parse(source).and_then(|t| t.resolve(ctx, false)) {
                Ok(value) => {
                    resolved.insert(parameter.clone(), value);
                }
                Err(error) => return finish_failed(result, &error, started),
            }
        }
        let resolved_input = Value::Object(resolved);
        if options.dry_run {
            result.resolved_input = Some(resolved_input.clone());
        }

        let task = match step.target() {
            Err(error) => return finish_failed(result, &error, started),
            Ok(StepTarget::Workflow(reference)) => {
                let reference = reference.to_string();
                return self
                    .run_subworkflow_step(
                        step,
                        &reference,
                        resolved_input,
                        ctx,
                        stack,
                        options,
                        cancel,
                        result,
                        started,
                    )
                    .await;
            }
            Ok(StepTarget::Task(reference)) => match self.resolver.get_task(reference).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    return finish_failed(
                        result,
                        &EngineError::TaskNotFound {
                            reference: reference.to_string(),
                        },
                        started,
                    )
                }
                Err(error) => return finish_failed(result, &error, started),
            },
        };

        if let Some(input_schema) = &task.spec.input_schema {
            match schema::validate(input_schema, &resolved_input) {
                Ok(violations) if violations.is_empty() => {}
                Ok(violations) => {
                    return finish_failed(
                        result,
                        &EngineError::ValidationFailed { violations },
                        started,
                    )
                }
                Err(error) => return finish_failed(result, &error, started),
            }
        }

        match task.spec.kind {
            TaskKind::SubWorkflow => {
                let Some(reference) = task.spec.workflow.clone() else {
                    return finish_failed(
                        result,
                        &EngineError::InvalidTask {
                            reference: task.metadata.qualified_name(),
                            message: "subworkflow task names no workflow".to_string(),
                        },
                        started,
                    );
                };
                self.run_subworkflow_step(
                    step,
                    &reference,
                    resolved_input,
                    ctx,
                    stack,
                    options,
                    cancel,
                    result,
                    started,
                )
                .await
            }
            TaskKind::Transform => {
                if options.dry_run {
                    result.status = StepStatus::Skipped;
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    return result;
                }
                match render_transform(&task, &resolved_input) {
                    Ok(output) => {
                        result.attempts = 1;
                        finish_success(result, output, started)
                    }
                    Err(error) => finish_failed(result, &error, started),
                }
            }
            TaskKind::Http => {
                self.run_http_step(step, &task, resolved_input, options, cancel, result, started)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_http_step(
        &self,
        step: &Step,
        task: &TaskDocument,
        resolved_input: Value,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
        mut result: StepResult,
        started: Instant,
    ) -> StepResult {
        let Some(request_spec) = &task.spec.request else {
            return finish_failed(
                result,
                &EngineError::InvalidTask {
                    reference: task.metadata.qualified_name(),
                    message: "HTTP task has no request".to_string(),
                },
                started,
            );
        };

        let request =
            match build_http_request(request_spec, &resolved_input, step.timeout_ms) {
                Ok(request) => request,
                Err(error) => return finish_failed(result, &error, started),
            };

        if options.dry_run {
            result.status = StepStatus::Skipped;
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let service_key = task.metadata.qualified_name();
        let cache_config = step.cache.clone().or_else(|| task.spec.cache.clone());
        let key = cache_key(
            &service_key,
            request.method,
            &request.url,
            &request.headers,
            request.body.as_ref(),
        );

        if let Some(cache_config) = &cache_config {
            if cache_config.allows(request.method) {
                match self.cache.get(&key).await {
                    Ok(Some(hit)) => {
                        tracing::debug!(step = %step.id, "cache hit, skipping outbound call");
                        result.from_cache = true;
                        return finish_success(result, hit.body, started);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(step = %step.id, error = %error, "cache read failed")
                    }
                }
            }
        }

        let circuit_config = step
            .circuit
            .clone()
            .or_else(|| task.spec.circuit.clone())
            .unwrap_or_else(|| self.config.default_circuit.clone());

        match self.breaker.acquire(&service_key, &circuit_config).await {
            Ok(CircuitDecision::Allow { .. }) => {}
            Ok(CircuitDecision::Reject) => {
                tracing::warn!(step = %step.id, key = %service_key, "circuit open, call short-circuited");
                let error = EngineError::CircuitOpen {
                    key: service_key.clone(),
                };
                return self
                    .apply_fallback(step, task, &resolved_input, error, result, cancel, started)
                    .await;
            }
            Err(error) => return finish_failed(result, &error, started),
        }

        let policy = step
            .retry
            .clone()
            .or_else(|| task.spec.retry.clone())
            .unwrap_or_else(|| self.config.default_retry.clone());
        let outcome =
            retry_with_policy(&policy, cancel, |_| self.http.execute(&request, cancel)).await;
        result.attempts = outcome.attempts;

        match outcome.result {
            Ok(response) => {
                if let Err(error) = self
                    .breaker
                    .record_success(&service_key, &circuit_config)
                    .await
                {
                    tracing::warn!(error = %error, "circuit success record failed");
                }
                if let Some(cache_config) = &cache_config {
                    if cache_config.allows(request.method) {
                        let record = CachedResponse::from_response(&response);
                        if let Err(error) =
                            self.cache.set(&key, record, cache_config.ttl()).await
                        {
                            tracing::warn!(error = %error, "cache write failed");
                        }
                    }
                }
                finish_success(result, response.body, started)
            }
            Err(EngineError::Cancelled) => {
                finish_failed(result, &EngineError::Cancelled, started)
            }
            Err(error) => {
                if let Err(record_error) = self
                    .breaker
                    .record_failure(&service_key, &circuit_config)
                    .await
                {
                    tracing::warn!(error = %record_error, "circuit failure record failed");
                }
                self.apply_fallback(step, task, &resolved_input, error, result, cancel, started)
                    .await
            }
        }
    }

    /// One fallback attempt: no retry, no circuit, no cache. A fallback
    /// success replaces the step output; a fallback failure surfaces the
    /// original error.
    async fn apply_fallback(
        &self,
        step: &Step,
        task: &TaskDocument,
        resolved_input: &Value,
        original: EngineError,
        mut result: StepResult,
        cancel: &CancellationToken,
        started: Instant,
    ) -> StepResult {
        let Some(reference) = step.fallback.clone().or_else(|| task.spec.fallback.clone())
        else {
            return finish_failed(result, &original, started);
        };
        result.fallback_task_ref = Some(reference.clone());

        let fallback_task = match self.resolver.get_task(&reference).await {
            Ok(Some(task)) => task,
            Ok(None) | Err(_) => {
                tracing::warn!(step = %step.id, fallback = %reference, "fallback task unavailable");
                return finish_failed(result, &original, started);
            }
        };

        match self.invoke_once(&fallback_task, resolved_input, cancel).await {
            Ok(output) => {
                tracing::info!(step = %step.id, fallback = %reference, "fallback output used in place");
                result.used_fallback = true;
                finish_success(result, output, started)
            }
            Err(fallback_error) => {
                tracing::warn!(
                    step = %step.id,
                    fallback = %reference,
                    error = %fallback_error,
                    "fallback failed, surfacing original error"
                );
                finish_failed(result, &original, started)
            }
        }
    }

    async fn invoke_once(
        &self,
        task: &TaskDocument,
        resolved_input: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match task.spec.kind {
            TaskKind::Http => {
                let Some(request_spec) = &task.spec.request else {
                    return Err(EngineError::InvalidTask {
                        reference: task.metadata.qualified_name(),
                        message: "HTTP task has no request".to_string(),
                    });
                };
                let request = build_http_request(request_spec, resolved_input, None)?;
                let response = self.http.execute(&request, cancel).await?;
                Ok(response.body)
            }
            TaskKind::Transform => render_transform(task, resolved_input),
            TaskKind::SubWorkflow => Err(EngineError::InvalidTask {
                reference: task.metadata.qualified_name(),
                message: "fallback tasks cannot invoke workflows".to_string(),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_subworkflow_step(
        &self,
        step: &Step,
        reference: &str,
        resolved_input: Value,
        parent_ctx: &ExecutionContext,
        stack: &CallStack,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
        mut result: StepResult,
        started: Instant,
    ) -> StepResult {
        let workflow = match self.resolver.get_workflow(reference).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                return finish_failed(
                    result,
                    &EngineError::WorkflowNotFound {
                        reference: reference.to_string(),
                    },
                    started,
                )
            }
            Err(error) => return finish_failed(result, &error, started),
        };

        if options.dry_run {
            result.status = StepStatus::Skipped;
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let child_options = ExecutionOptions {
            timeout: None,
            max_concurrency: options.max_concurrency,
            dry_run: false,
            strict_output: options.strict_output,
            call_stack: None,
            cancellation: None,
        };

        let future = self.run_workflow(
            &workflow,
            parent_ctx.child(resolved_input),
            stack,
            &child_options,
            cancel,
        );
        let child = match step.timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), future).await {
                    Ok(child) => child,
                    Err(_) => {
                        return finish_failed(
                            result,
                            &EngineError::Timeout {
                                message: format!(
                                    "sub-workflow '{}' exceeded {}ms",
                                    reference, timeout_ms
                                ),
                            },
                            started,
                        )
                    }
                }
            }
            None => future.await,
        };

        result.attempts = 1;
        if child.success {
            return finish_success(result, child.output, started);
        }

        // Propagate the child failure with the failing child step id; the
        // child's error kind survives so callers can still match on it.
        let failing_step = child
            .steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::Cancelled))
            .map(|s| s.id.clone());
        let detail = child
            .error
            .unwrap_or_else(|| ErrorDetail::new("internal", "sub-workflow failed"));
        let message = match failing_step {
            Some(child_step) => format!(
                "sub-workflow '{}' failed at step '{}': {}",
                reference, child_step, detail.message
            ),
            None => format!("sub-workflow '{}' failed: {}", reference, detail.message),
        };
        result.status = StepStatus::Failed;
        result.error = Some(ErrorDetail::new(detail.kind, message));
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Type-compatibility checking across one step's dataflow edges.
    async fn check_dataflow(
        &self,
        workflow: &WorkflowDocument,
        step: &Step,
        task: &TaskDocument,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let Some(input_schema) = &task.spec.input_schema else {
            return;
        };

        for (parameter, source) in &step.input {
            let Ok(template) = Template::parse(source) else {
                continue; // already reported by planning
            };
            let Some(TemplateExpr::TaskOutput {
                step_id: producer_id,
                path,
            }) = template.as_single_expression()
            else {
                continue;
            };
            let Some(producer_step) =
                workflow.spec.tasks.iter().find(|s| &s.id == producer_id)
            else {
                continue; // unknown-dep reported by planning
            };
            let Some(producer_ref) = &producer_step.task_ref else {
                continue;
            };
            let Ok(Some(producer_task)) = self.resolver.get_task(producer_ref).await else {
                continue;
            };
            let Some(output_schema) = &producer_task.spec.output_schema else {
                continue;
            };
            let Some(parameter_schema) = input_schema.properties.get(parameter) else {
                continue;
            };

            if path.is_empty() {
                for incompatibility in schema::compatible(output_schema, parameter_schema) {
                    issues.push(ValidationIssue::from_error(
                        Some(&step.id),
                        &EngineError::TypeIncompatible {
                            step_id: step.id.clone(),
                            field: format!("{}.{}", parameter, incompatibility.field),
                            expected: incompatibility.expected,
                            found: incompatibility.found,
                        },
                    ));
                }
                continue;
            }

            match walk_schema(output_schema, path) {
                SchemaWalk::Found(produced) => {
                    if let (Some(produced_type), Some(expected_type)) =
                        (produced.schema_type, parameter_schema.schema_type)
                    {
                        if produced_type != expected_type {
                            issues.push(ValidationIssue::from_error(
                                Some(&step.id),
                                &EngineError::TypeIncompatible {
                                    step_id: step.id.clone(),
                                    field: parameter.clone(),
                                    expected: expected_type.to_string(),
                                    found: produced_type.to_string(),
                                },
                            ));
                        }
                    }
                }
                SchemaWalk::MissingDeclared => {
                    issues.push(ValidationIssue::from_error(
                        Some(&step.id),
                        &EngineError::TypeIncompatible {
                            step_id: step.id.clone(),
                            field: parameter.clone(),
                            expected: parameter_schema
                                .schema_type
                                .map(|t| t.to_string())
                                .unwrap_or_else(|| "value".to_string()),
                            found: "nothing".to_string(),
                        },
                    ));
                }
                SchemaWalk::Unknown => {}
            }
        }
    }
}

enum SchemaWalk<'a> {
    Found(&'a Schema),
    /// The producer declares its properties and the path is not among
    /// them.
    MissingDeclared,
    /// The producer leaves this level open; nothing to check.
    Unknown,
}

fn walk_schema<'a>(schema: &'a Schema, path: &[String]) -> SchemaWalk<'a> {
    let mut current = schema;
    for segment in path {
        if current.properties.is_empty() {
            return SchemaWalk::Unknown;
        }
        match current.properties.get(segment) {
            Some(next) => current = next,
            None => return SchemaWalk::MissingDeclared,
        }
    }
    SchemaWalk::Found(current)
}

/// Resolve an HTTP request spec against the task's resolved input. The
/// URL resolves strictly; headers and body are lenient.
fn build_http_request(
    request_spec: &HttpRequestSpec,
    resolved_input: &Value,
    step_timeout_ms: Option<u64>,
) -> Result<HttpTaskRequest> {
    let scope = ExecutionContext::new(resolved_input.clone());
    let url = render_string(&request_spec.url, &scope, true)?;
    let mut headers = BTreeMap::new();
    for (name, value) in &request_spec.headers {
        headers.insert(name.clone(), render_string(value, &scope, false)?);
    }
    let body = match &request_spec.body {
        Some(body) => Some(render_json(body, &scope)?),
        None => None,
    };
    let timeout = step_timeout_ms
        .or(request_spec.timeout_ms)
        .map(Duration::from_millis);
    Ok(HttpTaskRequest {
        method: request_spec.method,
        url,
        headers,
        body,
        timeout,
    })
}

fn render_transform(task: &TaskDocument, resolved_input: &Value) -> Result<Value> {
    let Some(transform) = &task.spec.transform else {
        return Err(EngineError::InvalidTask {
            reference: task.metadata.qualified_name(),
            message: "transform task has no output mapping".to_string(),
        });
    };
    let scope = ExecutionContext::new(resolved_input.clone());
    let mut output = Map::new();
    for (field, source) in &transform.output {
        output.insert(field.clone(), Template::parse(source)?.resolve(&scope, false)?);
    }
    let value = Value::Object(output);
    if let Some(output_schema) = &task.spec.output_schema {
        let violations = schema::validate(output_schema, &value)?;
        if !violations.is_empty() {
            return Err(EngineError::ValidationFailed { violations });
        }
    }
    Ok(value)
}

fn resolve_output(
    mapping: &BTreeMap<String, String>,
    ctx: &ExecutionContext,
    strict: bool,
) -> Result<Value> {
    if mapping.is_empty() {
        return Ok(Value::Null);
    }
    let mut output = Map::new();
    for (field, source) in mapping {
        output.insert(field.clone(), Template::parse(source)?.resolve(ctx, strict)?);
    }
    Ok(Value::Object(output))
}

fn render_string(source: &str, scope: &ExecutionContext, strict: bool) -> Result<String> {
    let value = Template::parse(source)?.resolve(scope, strict)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Walk a JSON template: strings resolve as templates (single
/// expressions keep their type), composites recurse, scalars copy.
fn render_json(value: &Value, scope: &ExecutionContext) -> Result<Value> {
    match value {
        Value::String(source) => Template::parse(source)?.resolve(scope, false),
        Value::Object(fields) => {
            let mut rendered = Map::new();
            for (name, field) in fields {
                rendered.insert(name.clone(), render_json(field, scope)?);
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(elements) => {
            let rendered: Result<Vec<Value>> =
                elements.iter().map(|element| render_json(element, scope)).collect();
            Ok(Value::Array(rendered?))
        }
        other => Ok(other.clone()),
    }
}

fn finish_success(mut result: StepResult, output: Value, started: Instant) -> StepResult {
    result.status = StepStatus::Success;
    result.output = Some(output);
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

fn finish_failed(mut result: StepResult, error: &EngineError, started: Instant) -> StepResult {
    result.status = if matches!(error, EngineError::Cancelled) {
        StepStatus::Cancelled
    } else {
        StepStatus::Failed
    };
    result.error = Some(error.into());
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

fn early_failure(
    execution_id: Uuid,
    error: ErrorDetail,
    started: Instant,
    graph_micros: Option<u64>,
) -> ExecutionResult {
    ExecutionResult {
        execution_id,
        success: false,
        output: Value::Null,
        steps: Vec::new(),
        duration_ms: started.elapsed().as_millis() as u64,
        graph_build_duration_micros: graph_micros,
        plan: None,
        error: Some(error),
    }
}
