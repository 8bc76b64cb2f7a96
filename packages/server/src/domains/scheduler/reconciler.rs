//! Converges the live scheduler onto the enabled rows of `job_definitions`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::executor::JobExecutor;
use super::handlers::SchedulerError;
use super::live::{FireFn, LiveScheduler, Registration};
use super::models::{JobDefinition, RunStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub registered: Vec<String>,
    pub deregistered: Vec<String>,
    pub rejected: Vec<String>,
    pub unchanged: usize,
}

pub struct CronReconciler {
    executor: Arc<JobExecutor>,
    live: Arc<dyn LiveScheduler>,
    /// Job id -> version already reported as unregistrable
    rejected: Mutex<HashMap<String, i64>>,
}

impl CronReconciler {
    pub fn new(executor: Arc<JobExecutor>, live: Arc<dyn LiveScheduler>) -> Self {
        Self {
            executor,
            live,
            rejected: Mutex::new(HashMap::new()),
        }
    }

    pub fn live(&self) -> &Arc<dyn LiveScheduler> {
        &self.live
    }

    /// One reconcile pass.
    ///
    /// A definition is (re)registered only when its version differs from the
    /// registered one. Registered ids missing from the enabled set are
    /// deregistered. A definition with a malformed cron or an unknown
    /// func_key is left unregistered and gets one `error` run per version.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let jobs = self.executor.store().fetch_enabled().await?;
        let registered: HashMap<String, i64> = self
            .live
            .registered()
            .into_iter()
            .map(|job| (job.job_id, job.version))
            .collect();

        let mut summary = ReconcileSummary::default();
        let mut seen = HashSet::new();

        for job in jobs {
            seen.insert(job.id.clone());

            if registered.get(&job.id) == Some(&job.version) {
                summary.unchanged += 1;
                continue;
            }

            match self.prepare(&job) {
                Ok(registration) => {
                    if let Err(e) = self.live.register(registration, self.fire_fn()).await {
                        error!(job_id = %job.id, error = %e, "failed to register job");
                        continue;
                    }
                    self.forget_rejection(&job.id);
                    info!(
                        job_id = %job.id,
                        version = job.version,
                        cron_expr = %job.cron_expr,
                        "job registered"
                    );
                    summary.registered.push(job.id.clone());
                }
                Err(e) => {
                    if registered.contains_key(&job.id) {
                        self.live.deregister(&job.id).await?;
                        info!(job_id = %job.id, "stale registration removed");
                    }
                    self.reject(&job, &e).await?;
                    summary.rejected.push(job.id.clone());
                }
            }
        }

        for job_id in registered.keys().filter(|id| !seen.contains(*id)) {
            if self.live.deregister(job_id).await? {
                info!(job_id = %job_id, "job deregistered (disabled or deleted)");
                summary.deregistered.push(job_id.clone());
            }
        }

        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id, _| seen.contains(id));

        summary.deregistered.sort();
        debug!(?summary, "reconcile finished");
        Ok(summary)
    }

    fn prepare(&self, job: &JobDefinition) -> Result<Registration, SchedulerError> {
        let registration = Registration::from_definition(job)?;
        self.executor.handlers().resolve(&job.func_key)?;
        Ok(registration)
    }

    /// Record the configuration error once per definition version.
    async fn reject(&self, job: &JobDefinition, error: &SchedulerError) -> Result<()> {
        let first_report = {
            let mut rejected = self.rejected.lock().unwrap_or_else(|e| e.into_inner());
            rejected.insert(job.id.clone(), job.version) != Some(job.version)
        };
        if !first_report {
            return Ok(());
        }

        warn!(job_id = %job.id, version = job.version, error = %error, "job not registered");
        let store = self.executor.store();
        let now = Utc::now();
        let run_id = store.create_run(&job.id, None, now).await?;
        store
            .finish_run(run_id, RunStatus::Error, None, Some(&error.to_string()), now)
            .await?;
        Ok(())
    }

    fn forget_rejection(&self, job_id: &str) {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    fn fire_fn(&self) -> FireFn {
        let executor = self.executor.clone();
        Arc::new(move |job_id: String, scheduled_time: DateTime<Utc>| -> BoxFuture<'static, ()> {
            let executor = executor.clone();
            Box::pin(async move {
                match executor.execute(&job_id, None, Some(scheduled_time)).await {
                    Ok(report) => debug!(
                        job_id = %job_id,
                        run_id = report.run_id,
                        status = %report.status,
                        "scheduled fire finished"
                    ),
                    Err(e) => error!(job_id = %job_id, error = %e, "scheduled fire could not be recorded"),
                }
            })
        })
    }
}
