//! Cron scheduler control: lifecycle, run-now and run history.

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domains::scheduler::{JobOverview, JobRun, RunReport, SchedulerStatus};
use crate::server::app::AppState;
use crate::server::error::ApiError;

const DEFAULT_RUNS_LIMIT: i64 = 50;
const MAX_RUNS_LIMIT: i64 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct RunNowRequest {
    /// Replaces the stored params for this run only
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

pub async fn scheduler_status(Extension(state): Extension<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status().await)
}

pub async fn scheduler_start(
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    let summary = state.scheduler.start().await?;
    Ok(Json(json!({ "ok": true, "reconciled": summary })))
}

pub async fn scheduler_stop(Extension(state): Extension<AppState>) -> Result<Json<Value>, ApiError> {
    state.scheduler.stop().await?;
    Ok(Json(json!({ "ok": true })))
}

/// Runs inline and returns the run's outcome. An empty body uses the stored
/// params.
pub async fn scheduler_run_now(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> Result<Json<RunReport>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RunNowRequest::default()
    } else {
        serde_json::from_slice::<RunNowRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid run-now body: {}", e)))?
    };

    let report = state.scheduler.run_now(&job_id, request.params).await?;
    Ok(Json(report))
}

pub async fn scheduler_jobs(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<JobOverview>>, ApiError> {
    Ok(Json(state.scheduler.overview().await?))
}

pub async fn scheduler_runs(
    Extension(state): Extension<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<JobRun>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    Ok(Json(state.scheduler.recent_runs(limit).await?))
}
