use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;
use crate::db::queries;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database_latency_ms: Option<u64>,
    pub backlog: Option<Backlog>,
}

/// Jobs not yet in a terminal state.
#[derive(Serialize)]
pub struct Backlog {
    pub pending: i64,
    pub processing: i64,
}

/// GET /health: job table reachability and backlog.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();

    let (status_code, response) = match queries::job_backlog(&state.db).await {
        Ok((pending, processing)) => (
            StatusCode::OK,
            HealthResponse {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
                database_latency_ms: Some(start.elapsed().as_millis() as u64),
                backlog: Some(Backlog {
                    pending,
                    processing,
                }),
            },
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check: job table unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                HealthResponse {
                    status: "degraded",
                    version: env!("CARGO_PKG_VERSION"),
                    database_latency_ms: None,
                    backlog: None,
                },
            )
        }
    };

    (status_code, Json(response))
}
