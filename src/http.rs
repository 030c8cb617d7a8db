//! Health endpoints and API error mapping.
//!
//! - `GET /health/live`: process is up
//! - `GET /health/ready`: readiness latch and shutdown state, never touches the pool
//! - `GET /health/pool`: pool counters
//! - `GET /health/db`: `SELECT 1` through the retrying executor
//!
//! Failures are rendered by [`ApiError`]: a generic message plus a
//! correlation id. The underlying error is only logged.

use crate::db::{
    Connector, ExecuteOptions, FetchMode, PoolStatus, QueryExecutor, ReadinessState, classify,
};
use crate::error::DbError;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

/// Upper bound for the `/health/db` round trip, retries included.
pub const DB_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Response header carrying the correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Shared state for the health router.
pub struct HealthState<C: Connector> {
    pub readiness: Arc<ReadinessState>,
    pub executor: QueryExecutor<C>,
    pub started_at: DateTime<Utc>,
    /// Cancelled once shutdown begins; `/health/ready` then reports draining.
    pub shutdown: Option<CancellationToken>,
}

impl<C: Connector> HealthState<C> {
    pub fn new(readiness: Arc<ReadinessState>, executor: QueryExecutor<C>) -> Self {
        Self {
            readiness,
            executor,
            started_at: Utc::now(),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    fn is_draining(&self) -> bool {
        self.shutdown.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

pub fn router<C: Connector>(state: Arc<HealthState<C>>) -> Router {
    Router::new()
        .route("/health/live", get(live::<C>))
        .route("/health/ready", get(ready::<C>))
        .route("/health/pool", get(pool_status::<C>))
        .route("/health/db", get(db_check::<C>))
        .with_state(state)
}

async fn live<C: Connector>(State(state): State<Arc<HealthState<C>>>) -> Json<serde_json::Value> {
    let uptime = Utc::now() - state.started_at;
    Json(json!({
        "status": "alive",
        "uptime_secs": uptime.num_seconds(),
    }))
}

async fn ready<C: Connector>(State(state): State<Arc<HealthState<C>>>) -> Response {
    let snapshot = state.readiness.snapshot();
    let (status, label) = if state.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else if snapshot.ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    // Readiness errors can carry driver text; keep it server-side.
    let body = Json(json!({
        "status": label,
        "ready_at": snapshot.ready_at,
    }));
    (status, body).into_response()
}

async fn pool_status<C: Connector>(State(state): State<Arc<HealthState<C>>>) -> Json<PoolStatus> {
    Json(state.executor.pool().status())
}

async fn db_check<C: Connector>(
    State(state): State<Arc<HealthState<C>>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = std::time::Instant::now();
    let options = ExecuteOptions::default().with_timeout(DB_CHECK_TIMEOUT);
    state
        .executor
        .execute_with("SELECT 1", &[], FetchMode::Scalar, &options)
        .await?;
    Ok(Json(json!({
        "status": "ok",
        "latency_ms": started.elapsed().as_millis() as u64,
    })))
}

/// HTTP status an error is reported with.
pub fn status_for(error: &DbError) -> StatusCode {
    match error {
        DbError::PoolExhausted { .. }
        | DbError::PoolClosed
        | DbError::DeadlineExceeded { .. }
        | DbError::Cancelled { .. }
        | DbError::ReadinessTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DbError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        DbError::Driver(_) if classify(error).is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-facing error. Never exposes the underlying error text.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    correlation_id: Uuid,
    error: DbError,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn into_inner(self) -> DbError {
        self.error
    }

    fn public_message(&self) -> &'static str {
        match self.status {
            StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable",
            StatusCode::TOO_MANY_REQUESTS => "Too many requests",
            _ => "Internal server error",
        }
    }
}

impl From<DbError> for ApiError {
    fn from(error: DbError) -> Self {
        Self {
            status: status_for(&error),
            correlation_id: Uuid::new_v4(),
            error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                correlation_id = %self.correlation_id,
                status = self.status.as_u16(),
                error = %self.error,
                "Request failed"
            );
        } else {
            warn!(
                correlation_id = %self.correlation_id,
                status = self.status.as_u16(),
                error = %self.error,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error": self.public_message(),
            "correlation_id": self.correlation_id.to_string(),
        }));
        let mut response = (self.status, body).into_response();

        if let Ok(value) = HeaderValue::from_str(&self.correlation_id.to_string()) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        if let DbError::RateLimited {
            retry_after_secs, ..
        } = &self.error
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        response
    }
}
