// ABOUTME: Router and server tests for the query gateway
// ABOUTME: Drives requests through the router with an in-memory executor

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use ct_replicator::tracking::QueryOutput;
use ct_replicator::value::Value;
use ct_replicator::SyncError;
use query_gateway::{router, serve, GatewayConfig, QueryExecutor};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

#[derive(Default)]
struct FakeExecutor {
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    fail: bool,
    delay: Option<Duration>,
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn query(&self, sql: &str, args: &[Value]) -> ct_replicator::Result<QueryOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((sql.to_string(), args.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(SyncError::destination_rejected("relation \"missing\" does not exist"));
        }
        Ok(QueryOutput {
            columns: vec!["id".to_string(), "name".to_string()],
            rows: vec![
                vec![Value::Int(1), Value::from("a")],
                vec![Value::Int(2), Value::Null],
            ],
        })
    }
}

fn config() -> GatewayConfig {
    GatewayConfig {
        query_timeout: Duration::from_millis(200),
        shutdown_timeout: Duration::from_secs(1),
    }
}

fn post_query(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/query")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_returns_ok() {
    let app = router(Arc::new(FakeExecutor::default()), &config());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn test_query_returns_columns_rows_and_latency() {
    let executor = Arc::new(FakeExecutor::default());
    let app = router(executor.clone(), &config());

    let response = app
        .oneshot(post_query(
            r#"{"sql": "SELECT id, name FROM orders WHERE id > $1", "args": [0]}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["columns"], serde_json::json!(["id", "name"]));
    assert_eq!(body["rows"][0], serde_json::json!([1, "a"]));
    assert!(body["rows"][1][1].is_null());
    assert!(body["latencyMs"].is_u64());

    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, vec![Value::Int(0)]);
}

#[tokio::test]
async fn test_empty_sql_is_bad_request() {
    let executor = Arc::new(FakeExecutor::default());
    let app = router(executor.clone(), &config());

    let response = app.oneshot(post_query(r#"{"sql": "   "}"#)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "sql is required");
    assert!(executor.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let app = router(Arc::new(FakeExecutor::default()), &config());
    let response = app.oneshot(post_query("{not json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().starts_with("invalid request"));
}

#[tokio::test]
async fn test_execution_failure_is_internal_error() {
    let executor = FakeExecutor {
        fail: true,
        ..FakeExecutor::default()
    };
    let app = router(Arc::new(executor), &config());
    let response = app
        .oneshot(post_query(r#"{"sql": "SELECT * FROM missing"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("does not exist"));
    assert!(body["latencyMs"].is_u64());
}

#[tokio::test]
async fn test_slow_query_times_out() {
    let executor = FakeExecutor {
        delay: Some(Duration::from_secs(5)),
        ..FakeExecutor::default()
    };
    let app = router(Arc::new(executor), &config());
    let response = app
        .oneshot(post_query(r#"{"sql": "SELECT pg_sleep(5)"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_serve_stops_on_shutdown() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app = router(Arc::new(FakeExecutor::default()), &config());
    let shutdown = CancellationToken::new();

    let server = tokio::spawn(serve(
        listener,
        app,
        shutdown.clone(),
        Duration::from_secs(1),
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(3), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}
