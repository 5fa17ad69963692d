//! HTTP front-end for the master.
//!
//! Exposes the query and ingest surface over HTTP using axum.
//!
//! # Endpoints
//!
//! - `POST /query` - Submit a nearest-neighbor query, returns its id
//! - `GET /query/{id}` - Poll for a query's merged result
//! - `POST /points` - Route a point to its owning worker
//! - `GET /health` - Master health and telemetry

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::master::{Master, MasterError, PollOutcome, QueryOutcome};
use crate::metric::Metric;
use crate::model::Point;

/// Shared application state
pub struct AppState {
    pub master: Arc<Master>,
    started: Instant,
}

impl AppState {
    pub fn new(master: Arc<Master>) -> Self {
        Self {
            master,
            started: Instant::now(),
        }
    }
}

/// Query submission body
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitQueryRequest {
    /// Query vector
    pub vector: Vec<f32>,

    /// Metric tag, case-insensitive (default: euclidean)
    #[serde(default)]
    pub metric: Option<String>,

    /// Number of results to return (default: 10)
    #[serde(default = "default_k")]
    pub k: i32,
}

fn default_k() -> i32 {
    10
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitQueryResponse {
    pub query_id: i64,
}

/// Point ingestion body
#[derive(Debug, Serialize, Deserialize)]
pub struct AddPointRequest {
    pub id: i32,
    pub vector: Vec<f32>,
}

/// Single merged search result
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResultEntry {
    pub id: i32,
    pub distance: f32,
}

/// Completed query response
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResultResponse {
    pub results: Vec<QueryResultEntry>,

    /// False when some queried workers never reported
    pub complete: bool,

    /// Workers that never reported for this query
    pub lost_workers: usize,
}

impl From<QueryOutcome> for QueryResultResponse {
    fn from(outcome: QueryOutcome) -> Self {
        Self {
            results: outcome
                .results
                .into_iter()
                .map(|(id, distance)| QueryResultEntry { id, distance })
                .collect(),
            complete: outcome.complete,
            lost_workers: outcome.lost_workers,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub workers: usize,
    pub active_queries: usize,
    pub uptime_s: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn master_error_response(error: MasterError) -> Response {
    let status = match error {
        MasterError::InvalidK(_) => StatusCode::BAD_REQUEST,
        MasterError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        MasterError::NoWorkersAvailable | MasterError::WorkerUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// POST /query - Submit a query for the k nearest neighbors
async fn submit_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitQueryRequest>,
) -> Response {
    let metric = match request.metric.as_deref() {
        None => Metric::Euclidean,
        Some(tag) => match Metric::from_tag(tag) {
            Some(metric) => metric,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: format!("unknown metric {tag:?}"),
                    }),
                )
                    .into_response();
            }
        },
    };

    match state.master.submit_query(request.vector, metric, request.k) {
        Ok(query_id) => (StatusCode::OK, Json(SubmitQueryResponse { query_id })).into_response(),
        Err(e) => master_error_response(e),
    }
}

/// GET /query/{id} - Poll for a query's merged result
///
/// The result is consumed by the first successful poll; later polls for the
/// same id report 404.
async fn poll_query(State(state): State<Arc<AppState>>, Path(query_id): Path<i64>) -> Response {
    match state.master.poll(query_id) {
        PollOutcome::Ready(outcome) => {
            (StatusCode::OK, Json(QueryResultResponse::from(outcome))).into_response()
        }
        PollOutcome::Pending => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "pending" })),
        )
            .into_response(),
        PollOutcome::Unknown => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown query id {query_id}"),
            }),
        )
            .into_response(),
    }
}

/// POST /points - Route a point to its owning worker
async fn add_point(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddPointRequest>,
) -> Response {
    match state
        .master
        .add_point(Point::new(request.id, request.vector))
    {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => master_error_response(e),
    }
}

/// GET /health - Master health and telemetry
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        workers: state.master.worker_count(),
        active_queries: state.master.active_queries(),
        uptime_s: state.started.elapsed().as_secs(),
    };
    (StatusCode::OK, Json(response))
}

/// Create the axum router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(submit_query))
        .route("/query/{id}", get(poll_query))
        .route("/points", post(add_point))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Start the server; returns once a shutdown signal arrives.
pub async fn serve(state: Arc<AppState>, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let router = create_router(state);

    tracing::info!("http front-end listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not install ctrl-c handler");
    }
}
