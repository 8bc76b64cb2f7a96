//! Execution of one cron job fire.
//!
//! Scheduled fires and operator run-now share this path:
//!
//! ```text
//! create run (running)
//!   ├─ definition missing or disabled -> skipped "disabled-or-missing"
//!   ├─ func_key unknown               -> error "unknown func_key=..."
//!   ├─ named lock busy                -> skipped "locked"
//!   └─ handler                        -> ok (result) | error (message)
//! ```
//!
//! Any store or lock failure after the run row exists finalizes it as
//! `error` with an `outer: ` prefix.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::handlers::JobHandlerRegistry;
use super::models::RunStatus;
use super::store::JobStore;
use crate::kernel::NamedLock;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(900);

pub const REASON_DISABLED_OR_MISSING: &str = "disabled-or-missing";
pub const REASON_LOCKED: &str = "locked";

/// Outcome of one execution, as recorded on its run row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: i64,
    pub job_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunReport {
    fn new(run_id: i64, job_id: &str, status: RunStatus) -> Self {
        Self {
            run_id,
            job_id: job_id.to_string(),
            status,
            result: None,
            error: None,
            reason: None,
        }
    }
}

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    handlers: Arc<JobHandlerRegistry>,
    lock: Arc<dyn NamedLock>,
    lock_ttl: Duration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<JobHandlerRegistry>,
        lock: Arc<dyn NamedLock>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            handlers,
            lock,
            lock_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn handlers(&self) -> &JobHandlerRegistry {
        &self.handlers
    }

    pub fn lock(&self) -> &Arc<dyn NamedLock> {
        &self.lock
    }

    /// Execute `job_id` once. `params_override` replaces the stored params
    /// (run-now); scheduled fires pass `None`.
    ///
    /// Only a failure to create the run row is returned as `Err`; everything
    /// after that ends up on the row.
    pub async fn execute(
        &self,
        job_id: &str,
        params_override: Option<Value>,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<RunReport> {
        let run_id = self.store.create_run(job_id, scheduled_time, Utc::now()).await?;

        match self.execute_run(run_id, job_id, params_override).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let message = format!("outer: {:#}", e);
                error!(job_id = %job_id, run_id, error = %message, "job execution failed");
                self.store
                    .finish_run(run_id, RunStatus::Error, None, Some(&message), Utc::now())
                    .await?;
                let mut report = RunReport::new(run_id, job_id, RunStatus::Error);
                report.error = Some(message);
                Ok(report)
            }
        }
    }

    async fn execute_run(
        &self,
        run_id: i64,
        job_id: &str,
        params_override: Option<Value>,
    ) -> Result<RunReport> {
        let job = match self.store.get(job_id).await? {
            Some(job) if job.enabled => job,
            _ => {
                info!(job_id = %job_id, run_id, "job disabled or missing, skipping");
                return self.skip(run_id, job_id, REASON_DISABLED_OR_MISSING).await;
            }
        };

        let handler = match self.handlers.resolve(&job.func_key) {
            Ok(handler) => handler,
            Err(e) => {
                let message = e.to_string();
                warn!(job_id = %job_id, run_id, func_key = %job.func_key, "unknown func_key");
                self.store
                    .finish_run(run_id, RunStatus::Error, None, Some(&message), Utc::now())
                    .await?;
                let mut report = RunReport::new(run_id, job_id, RunStatus::Error);
                report.reason = Some(message.clone());
                report.error = Some(message);
                return Ok(report);
            }
        };

        let lock_key = job.effective_lock_key();
        let Some(guard) = self.lock.try_acquire(&lock_key, self.lock_ttl).await? else {
            info!(job_id = %job_id, run_id, lock_key = %lock_key, "lock held elsewhere, skipping");
            return self.skip(run_id, job_id, REASON_LOCKED).await;
        };

        let params = params_override.unwrap_or_else(|| job.params_or_empty());
        info!(job_id = %job_id, run_id, func_key = %job.func_key, "job started");

        // A panicking handler is recorded like any other failure.
        let outcome = AssertUnwindSafe(handler.run(params))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("job handler panicked")));

        let finished = match outcome {
            Ok(result) => {
                info!(job_id = %job_id, run_id, "job finished");
                self.store
                    .finish_run(run_id, RunStatus::Ok, Some(result.clone()), None, Utc::now())
                    .await
                    .map(|_| {
                        let mut report = RunReport::new(run_id, job_id, RunStatus::Ok);
                        report.result = Some(result);
                        report
                    })
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(job_id = %job_id, run_id, error = %message, "job failed");
                self.store
                    .finish_run(run_id, RunStatus::Error, None, Some(&message), Utc::now())
                    .await
                    .map(|_| {
                        let mut report = RunReport::new(run_id, job_id, RunStatus::Error);
                        report.error = Some(message);
                        report
                    })
            }
        };

        if let Err(e) = guard.release().await {
            warn!(job_id = %job_id, lock_key = %lock_key, error = %e, "failed to release job lock");
        }

        finished
    }

    async fn skip(&self, run_id: i64, job_id: &str, reason: &str) -> Result<RunReport> {
        let result = json!({ "status": "skipped", "reason": reason, "job_id": job_id });
        self.store
            .finish_run(run_id, RunStatus::Skipped, Some(result.clone()), None, Utc::now())
            .await?;
        let mut report = RunReport::new(run_id, job_id, RunStatus::Skipped);
        report.result = Some(result);
        report.reason = Some(reason.to_string());
        Ok(report)
    }
}
