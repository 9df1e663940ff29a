//! HTTP task execution.
//!
//! [`HttpExecutor`] performs exactly one attempt; retry is layered on by
//! the orchestrator through [`retry_with_policy`](crate::error::retry::retry_with_policy).
//! Non-2xx responses become structured errors with the body captured for
//! the error payload: `5xx`, `408`, and `429` are retriable, every other
//! `4xx` is fatal.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::model::HttpMethod;

/// A fully resolved request: templates have already been evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpTaskRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpTaskResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// Capability for performing one HTTP attempt.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &HttpTaskRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpTaskResponse>;
}

/// Production executor backed by a shared [`reqwest::Client`].
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(
        &self,
        request: &HttpTaskRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpTaskResponse> {
        let mut builder = self
            .client
            .request(to_reqwest(request.method), request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            // Content type defaults to application/json when a body is
            // present; explicit headers above still win.
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let send = async move {
            let response = builder.send().await?;
            let status = response.status();
            let headers: BTreeMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.to_string(), v.to_string()))
                })
                .collect();
            let text = response.text().await?;
            let body = parse_body(&text);

            if status.is_success() {
                Ok(HttpTaskResponse {
                    status_code: status.as_u16(),
                    headers,
                    body,
                })
            } else {
                Err(classify_status(status.as_u16(), body))
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = send => result,
        }
    }
}

/// Map a non-2xx status onto the retriable/fatal split.
pub fn classify_status(status: u16, body: Value) -> EngineError {
    let message = format!("HTTP {}", status);
    if status >= 500 || status == 408 || status == 429 {
        EngineError::HttpRetriable {
            status: Some(status),
            message,
            body: Some(body),
        }
    } else {
        EngineError::HttpFatal {
            status: Some(status),
            message,
            body: Some(body),
        }
    }
}

fn parse_body(text: &str) -> Value {
    if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
    }
}

fn to_reqwest(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::GET => reqwest::Method::GET,
        HttpMethod::POST => reqwest::Method::POST,
        HttpMethod::PUT => reqwest::Method::PUT,
        HttpMethod::DELETE => reqwest::Method::DELETE,
        HttpMethod::PATCH => reqwest::Method::PATCH,
    }
}
