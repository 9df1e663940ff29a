//! # Waveflow Core
//!
//! Workflow orchestration engine that executes declarative,
//! Kubernetes-style workflow definitions as DAGs of HTTP tasks:
//!
//! - Schema validation and type-compatibility checking across dataflow
//!   edges
//! - `{{input.x}}` / `{{tasks.<id>.output.y}}` template resolution
//! - Topological planning into parallel "waves"
//! - Resilient HTTP execution: retry with backoff, circuit breaking,
//!   response caching, fallback tasks
//! - Isolated sub-workflow invocation with cycle and depth guards
//!
//! ## Composition
//!
//! The [`Orchestrator`] depends on small capability traits
//! ([`registry::TaskResolver`], [`executor::HttpExecutor`],
//! [`executor::CacheProvider`], [`error::CircuitStore`]) assembled at
//! startup; serving layers (gateway, webhook, CLI) wrap its
//! transport-agnostic API.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use waveflow_core::prelude::*;
//!
//! # async fn demo() {
//! let resolver = Arc::new(InMemoryResolver::new());
//! let breaker = Arc::new(CircuitBreaker::new(Arc::new(InMemoryCircuitStore::new())));
//! let orchestrator = Orchestrator::new(
//!     resolver,
//!     Arc::new(ReqwestExecutor::new()),
//!     Arc::new(InMemoryCache::new()),
//!     breaker,
//! );
//!
//! let workflow = WorkflowBuilder::new("hello")
//!     .step(StepBuilder::new("greet").task_ref("greet-task").build())
//!     .output("greeting", "{{tasks.greet.output}}")
//!     .build();
//!
//! let result = orchestrator
//!     .execute(&workflow, json!({"name": "ada"}), ExecutionOptions::default())
//!     .await;
//! assert!(result.success);
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod template;
pub mod testing;

// Re-export commonly used types
pub use config::EngineConfig;
pub use context::{CallStack, ExecutionContext};
pub use error::{EngineError, ErrorDetail, Result};
pub use graph::ExecutionGraph;
pub use model::{TaskDocument, WorkflowDocument};
pub use orchestrator::{ExecutionOptions, ExecutionResult, Orchestrator};

/// Current version of the engine core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::context::{CallStack, ExecutionContext};
    pub use crate::error::{
        CircuitBreaker, CircuitBreakerConfig, CircuitState, EngineError, ErrorDetail,
        InMemoryCircuitStore, Result, RetryPolicy,
    };
    pub use crate::executor::{
        CacheConfig, CacheProvider, HttpExecutor, InMemoryCache, ReqwestExecutor,
    };
    pub use crate::graph::ExecutionGraph;
    pub use crate::model::{
        HttpMethod, Step, StepBuilder, TaskDocument, TaskKind, WorkflowBuilder,
        WorkflowDocument,
    };
    pub use crate::orchestrator::{
        ExecutionOptions, ExecutionResult, Orchestrator, StepStatus, ValidationReport,
    };
    pub use crate::registry::{InMemoryResolver, TaskResolver};
    pub use crate::schema::Schema;
    pub use crate::template::Template;
    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
}
