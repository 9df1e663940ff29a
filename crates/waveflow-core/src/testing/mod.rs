//! Test doubles for exercising the engine without external services.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::executor::http::{classify_status, HttpExecutor, HttpTaskRequest, HttpTaskResponse};
use crate::model::{
    HttpMethod, HttpRequestSpec, Metadata, TaskDocument, TaskKind, TaskSpec, API_VERSION,
    TASK_KIND,
};

/// One scripted reaction of the [`MockHttpExecutor`].
#[derive(Debug, Clone)]
pub enum MockResponse {
    Status { status: u16, body: Value },
    NetworkError,
}

impl MockResponse {
    pub fn ok(body: Value) -> Self {
        Self::Status { status: 200, body }
    }

    pub fn status(status: u16) -> Self {
        Self::Status {
            status,
            body: Value::Null,
        }
    }
}

/// Scripted HTTP executor keyed by `(method, url)`. Responses are
/// consumed in order; the last one repeats. An outbound call counter
/// backs the cache and breaker assertions.
#[derive(Default)]
pub struct MockHttpExecutor {
    scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    calls: AtomicU64,
    calls_by_key: Mutex<HashMap<String, u64>>,
}

impl MockHttpExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(method: HttpMethod, url: &str) -> String {
        format!("{} {}", method, url)
    }

    /// Queue a sequence of responses for one endpoint.
    pub fn script(&self, method: HttpMethod, url: &str, responses: Vec<MockResponse>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(Self::key(method, url), responses.into());
    }

    /// Shorthand for an endpoint that always answers the same way.
    pub fn respond(&self, method: HttpMethod, url: &str, status: u16, body: Value) {
        self.script(method, url, vec![MockResponse::Status { status, body }]);
    }

    /// Total outbound attempts across every endpoint.
    pub fn outbound_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, method: HttpMethod, url: &str) -> u64 {
        self.calls_by_key
            .lock()
            .unwrap()
            .get(&Self::key(method, url))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl HttpExecutor for MockHttpExecutor {
    async fn execute(
        &self,
        request: &HttpTaskRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpTaskResponse> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let key = Self::key(request.method, &request.url);
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_key
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert(0) += 1;

        let response = {
            let mut scripts = self.scripts.lock().unwrap();
            let Some(queue) = scripts.get_mut(&key) else {
                return Err(EngineError::Internal {
                    message: format!("no scripted response for {}", key),
                });
            };
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };

        match response {
            Some(MockResponse::Status { status, body }) if (200..300).contains(&status) => {
                Ok(HttpTaskResponse {
                    status_code: status,
                    headers: BTreeMap::new(),
                    body,
                })
            }
            Some(MockResponse::Status { status, body }) => Err(classify_status(status, body)),
            Some(MockResponse::NetworkError) => Err(EngineError::HttpRetriable {
                status: None,
                message: "connection refused".to_string(),
                body: None,
            }),
            None => Err(EngineError::Internal {
                message: format!("scripted responses exhausted for {}", key),
            }),
        }
    }
}

/// Minimal HTTP task document for tests: no schemas, no overrides.
pub fn http_task(name: &str, method: HttpMethod, url: &str) -> TaskDocument {
    TaskDocument {
        api_version: API_VERSION.to_string(),
        kind: TASK_KIND.to_string(),
        metadata: Metadata::named(name),
        spec: TaskSpec {
            kind: TaskKind::Http,
            input_schema: None,
            output_schema: None,
            request: Some(HttpRequestSpec {
                method,
                url: url.to_string(),
                headers: BTreeMap::new(),
                body: None,
                timeout_ms: None,
            }),
            transform: None,
            workflow: None,
            retry: None,
            cache: None,
            circuit: None,
            fallback: None,
        },
    }
}
