// ABOUTME: HTTP routes of the query gateway: POST /query and GET /health
// ABOUTME: Runs ad-hoc SQL against the destination store with a per-request timeout

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ct_replicator::tracking::{PostgresDestination, QueryOutput};
use ct_replicator::value::Value;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Runs read queries on behalf of the gateway.
#[async_trait]
pub trait QueryExecutor: Send + Sync + 'static {
    async fn query(&self, sql: &str, args: &[Value]) -> ct_replicator::Result<QueryOutput>;
}

/// Executor backed by the destination adapter, reading results page by page.
pub struct DestinationExecutor {
    destination: PostgresDestination,
    page_size: i32,
}

impl DestinationExecutor {
    pub fn new(destination: PostgresDestination, page_size: i32) -> Self {
        Self {
            destination,
            page_size,
        }
    }
}

#[async_trait]
impl QueryExecutor for DestinationExecutor {
    async fn query(&self, sql: &str, args: &[Value]) -> ct_replicator::Result<QueryOutput> {
        self.destination.query(sql, args, self.page_size).await
    }
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound for one /query request
    pub query_timeout: Duration,
    /// How long in-flight requests may drain after shutdown starts
    pub shutdown_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// App state shared across handlers
#[derive(Clone)]
struct AppState {
    executor: Arc<dyn QueryExecutor>,
    query_timeout: Duration,
}

/// Request body for the query endpoint
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    /// Positional parameters bound to $1, $2, ...
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    latency_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    latency_ms: u64,
}

fn latency_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn error_response(status: StatusCode, error: impl Into<String>, started: Instant) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            latency_ms: latency_ms(started),
        }),
    )
        .into_response()
}

/// Build the gateway router
pub fn router(executor: Arc<dyn QueryExecutor>, config: &GatewayConfig) -> Router {
    let state = AppState {
        executor,
        query_timeout: config.query_timeout,
    };

    Router::new()
        .route("/health", get(health))
        .route("/query", post(query))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "ok"
}

/// Execute a query and return its columns and rows
async fn query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid request: {}", rejection.body_text()),
                started,
            )
        }
    };
    if request.sql.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "sql is required", started);
    }

    let args: Vec<Value> = request.args.into_iter().map(Value::from).collect();
    match tokio::time::timeout(
        state.query_timeout,
        state.executor.query(&request.sql, &args),
    )
    .await
    {
        Ok(Ok(output)) => {
            tracing::debug!(
                "Query returned {} rows in {}ms",
                output.rows.len(),
                latency_ms(started)
            );
            (
                StatusCode::OK,
                Json(QueryResponse {
                    columns: output.columns,
                    rows: output.rows,
                    latency_ms: latency_ms(started),
                }),
            )
                .into_response()
        }
        Ok(Err(e)) => {
            tracing::warn!(kind = e.kind(), "Query failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), started)
        }
        Err(_) => {
            tracing::warn!("Query timed out after {:?}", state.query_timeout);
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                format!("query timed out after {:?}", state.query_timeout),
                started,
            )
        }
    }
}

/// Serve `app` until `shutdown` is cancelled, then drain in-flight requests
/// for at most `shutdown_timeout`.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    tracing::info!("Starting query gateway on http://{}", addr);

    let drain = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { drain.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("Server task failed")?.context("Server error")?;
            return Ok(());
        }
        _ = shutdown.cancelled() => {}
    }

    tracing::info!(
        "Shutting down, draining in-flight requests for up to {:?}",
        shutdown_timeout
    );
    match tokio::time::timeout(shutdown_timeout, &mut server).await {
        Ok(result) => {
            result.context("Server task failed")?.context("Server error")?;
            tracing::info!("Query gateway stopped");
        }
        Err(_) => {
            tracing::warn!(
                "In-flight requests did not finish within {:?}, aborting",
                shutdown_timeout
            );
            server.abort();
        }
    }
    Ok(())
}
