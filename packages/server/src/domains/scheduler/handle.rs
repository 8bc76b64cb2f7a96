//! Owned lifecycle of the cron scheduler.
//!
//! ```text
//! SchedulerHandle::start
//!     ├─► LiveScheduler (tokio-cron-scheduler)
//!     ├─► CronReconciler::reconcile   once, right away
//!     └─► reconcile loop              every reconcile_interval until stop
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::executor::{JobExecutor, RunReport};
use super::handlers::SchedulerError;
use super::live::{CronLiveScheduler, LiveScheduler, RegisteredJob};
use super::models::{JobDefinition, JobRun};
use super::reconciler::{CronReconciler, ReconcileSummary};
use crate::kernel::LockBackend;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Builds the live scheduler each time the handle starts.
pub type LiveSchedulerFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn LiveScheduler>>> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub lock_backend: LockBackend,
    pub registered: Vec<RegisteredJob>,
}

/// A definition with its registration and latest run.
#[derive(Debug, Clone, Serialize)]
pub struct JobOverview {
    #[serde(flatten)]
    pub definition: JobDefinition,
    pub registered_version: Option<i64>,
    pub last_run: Option<JobRun>,
}

struct Running {
    reconciler: Arc<CronReconciler>,
    cancel: CancellationToken,
    reconcile_task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

pub struct SchedulerHandle {
    executor: Arc<JobExecutor>,
    live_factory: LiveSchedulerFactory,
    reconcile_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl SchedulerHandle {
    pub fn new(executor: Arc<JobExecutor>, reconcile_interval: Duration) -> Self {
        Self {
            executor,
            live_factory: Arc::new(start_cron_live_scheduler),
            reconcile_interval,
            running: Mutex::new(None),
        }
    }

    pub fn with_live_factory(mut self, live_factory: LiveSchedulerFactory) -> Self {
        self.live_factory = live_factory;
        self
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    /// Start the live scheduler, reconcile once, then keep reconciling in
    /// the background. Fails with [`SchedulerError::AlreadyRunning`].
    pub async fn start(&self) -> Result<ReconcileSummary> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning.into());
        }

        let live = (self.live_factory)().await?;
        let reconciler = Arc::new(CronReconciler::new(self.executor.clone(), live));

        // A failed first pass is retried by the loop like any other.
        let summary = match reconciler.reconcile().await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "initial reconcile failed");
                ReconcileSummary::default()
            }
        };

        let cancel = CancellationToken::new();
        let reconcile_task = tokio::spawn(reconcile_loop(
            reconciler.clone(),
            self.reconcile_interval,
            cancel.clone(),
        ));

        *running = Some(Running {
            reconciler,
            cancel,
            reconcile_task,
            started_at: Utc::now(),
        });
        info!(
            interval_secs = self.reconcile_interval.as_secs(),
            registered = summary.registered.len(),
            "scheduler started"
        );
        Ok(summary)
    }

    /// Stop reconciling and shut the live scheduler down. Fails with
    /// [`SchedulerError::NotRunning`].
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(SchedulerError::NotRunning.into());
        };

        running.cancel.cancel();
        if let Err(e) = running.reconcile_task.await {
            error!(error = %e, "reconcile loop ended abnormally");
        }
        running.reconciler.live().shutdown().await?;
        info!("scheduler stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self.running.lock().await;
        SchedulerStatus {
            running: running.is_some(),
            started_at: running.as_ref().map(|r| r.started_at),
            lock_backend: self.executor.lock().backend(),
            registered: running
                .as_ref()
                .map(|r| r.reconciler.live().registered())
                .unwrap_or_default(),
        }
    }

    /// Reconcile immediately instead of waiting for the next tick.
    pub async fn reconcile_now(&self) -> Result<ReconcileSummary> {
        let reconciler = match self.running.lock().await.as_ref() {
            Some(running) => running.reconciler.clone(),
            None => return Err(SchedulerError::NotRunning.into()),
        };
        reconciler.reconcile().await
    }

    /// Execute a job now through the same path as a scheduled fire. Works
    /// whether or not the scheduler is running.
    pub async fn run_now(&self, job_id: &str, params: Option<Value>) -> Result<RunReport> {
        info!(job_id = %job_id, "manual run requested");
        self.executor.execute(job_id, params, Some(Utc::now())).await
    }

    pub async fn overview(&self) -> Result<Vec<JobOverview>> {
        let store = self.executor.store();
        let definitions = store.list().await?;
        let mut last_runs: HashMap<String, JobRun> = store
            .last_runs()
            .await?
            .into_iter()
            .map(|run| (run.job_id.clone(), run))
            .collect();
        let registered: HashMap<String, i64> = self
            .status()
            .await
            .registered
            .into_iter()
            .map(|job| (job.job_id, job.version))
            .collect();

        Ok(definitions
            .into_iter()
            .map(|definition| JobOverview {
                registered_version: registered.get(&definition.id).copied(),
                last_run: last_runs.remove(&definition.id),
                definition,
            })
            .collect())
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<JobRun>> {
        self.executor.store().recent_runs(limit).await
    }
}

fn start_cron_live_scheduler() -> BoxFuture<'static, Result<Arc<dyn LiveScheduler>>> {
    Box::pin(async {
        let live = CronLiveScheduler::start().await?;
        Ok(Arc::new(live) as Arc<dyn LiveScheduler>)
    })
}

async fn reconcile_loop(
    reconciler: Arc<CronReconciler>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = reconciler.reconcile().await {
            error!(error = %e, "reconcile failed");
        }
    }
}
