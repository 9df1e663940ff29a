//! The reqwest-backed executor against a local mock server: request
//! shaping, status classification, and the retry wrapper.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use waveflow_core::error::retry::{retry_with_policy, RetryPolicy};
use waveflow_core::error::EngineError;
use waveflow_core::executor::http::{HttpExecutor, HttpTaskRequest, ReqwestExecutor};
use waveflow_core::model::HttpMethod;

fn request(method: HttpMethod, url: String) -> HttpTaskRequest {
    HttpTaskRequest {
        method,
        url,
        headers: BTreeMap::new(),
        body: None,
        timeout: Some(Duration::from_secs(5)),
    }
}

#[tokio::test]
async fn posts_json_bodies_with_default_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/things"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"name": "ada"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
        .mount(&server)
        .await;

    let executor = ReqwestExecutor::new();
    let mut req = request(HttpMethod::POST, format!("{}/things", server.uri()));
    req.body = Some(json!({"name": "ada"}));

    let response = executor
        .execute(&req, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.status_code, 201);
    assert_eq!(response.body, json!({"id": 7}));
}

#[tokio::test]
async fn custom_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/guarded"))
        .and(header("x-tenant", "acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let executor = ReqwestExecutor::new();
    let mut req = request(HttpMethod::GET, format!("{}/guarded", server.uri()));
    req.headers
        .insert("X-Tenant".to_string(), "acme".to_string());

    let response = executor
        .execute(&req, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.body, json!({"ok": true}));
}

#[tokio::test]
async fn non_2xx_responses_become_structured_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "nope"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let executor = ReqwestExecutor::new();

    let fatal = executor
        .execute(
            &request(HttpMethod::GET, format!("{}/missing", server.uri())),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match fatal {
        EngineError::HttpFatal { status, body, .. } => {
            assert_eq!(status, Some(404));
            assert_eq!(body, Some(json!({"error": "nope"})));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let transient = executor
        .execute(
            &request(HttpMethod::GET, format!("{}/down", server.uri())),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(transient.kind(), "http-retriable");
}

#[tokio::test]
async fn retry_wrapper_recovers_from_transient_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let executor = ReqwestExecutor::new();
    let req = request(HttpMethod::GET, format!("{}/flaky", server.uri()));
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        multiplier: 2.0,
        max_delay_ms: 100,
        jitter: 0.0,
    };

    let cancel = CancellationToken::new();
    let outcome = retry_with_policy(&policy, &cancel, |_| executor.execute(&req, &cancel)).await;

    assert_eq!(outcome.attempts, 3);
    let response = outcome.result.unwrap();
    assert_eq!(response.body, json!({"ok": true}));
}

#[tokio::test]
async fn network_errors_are_retriable() {
    // Nothing listens on this port.
    let executor = ReqwestExecutor::new();
    let req = request(
        HttpMethod::GET,
        "http://127.0.0.1:9/unreachable".to_string(),
    );
    let error = executor
        .execute(&req, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(error.is_retriable(), "unexpected error: {:?}", error);
}
