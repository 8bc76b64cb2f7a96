//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Extension,
    http::Request,
    middleware::{self, Next},
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::domains::scheduler::SchedulerHandle;
use crate::domains::screener::{BaseScreener, ScreenerRunner};
use crate::kernel::jobs::WorkItemQueue;
use crate::server::middleware::run_token_middleware;
use crate::server::routes::{
    enqueue_work_item, get_work_item, health_handler, scheduler_jobs, scheduler_run_now,
    scheduler_runs, scheduler_start, scheduler_status, scheduler_stop, screener_start,
    screener_status, screener_stop,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub scheduler: Arc<SchedulerHandle>,
    pub screener_runner: Arc<ScreenerRunner>,
    /// Classifier handed to the runner on every start
    pub screener: Arc<dyn BaseScreener>,
    pub queue: Arc<dyn WorkItemQueue>,
    pub screener_idle_min: Duration,
    pub screener_idle_max: Duration,
    pub run_token: Option<Arc<str>>,
}

/// Build the admin router
///
/// Reads are open. Mutating routes sit behind the run-token check when a
/// token is configured.
pub fn build_app(state: AppState) -> Router {
    let run_token = state.run_token.clone();

    let mutating = Router::new()
        .route("/scheduler/start", post(scheduler_start))
        .route("/scheduler/stop", post(scheduler_stop))
        .route("/scheduler/run-now/:job_id", post(scheduler_run_now))
        .route("/screener/start", post(screener_start))
        .route("/screener/stop", post(screener_stop))
        .route("/work-items", post(enqueue_work_item))
        .route_layer(middleware::from_fn(
            move |request: Request<Body>, next: Next| {
                run_token_middleware(run_token.clone(), request, next)
            },
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/scheduler/status", get(scheduler_status))
        .route("/scheduler/jobs", get(scheduler_jobs))
        .route("/scheduler/runs", get(scheduler_runs))
        .route("/screener/status", get(screener_status))
        .route("/work-items/:id", get(get_work_item))
        .merge(mutating)
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}
