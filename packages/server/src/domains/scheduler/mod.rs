//! Cron job registry and reconciler.
//!
//! Recurring jobs are rows in `job_definitions`. A [`SchedulerHandle`] keeps
//! the in-process cron scheduler in step with those rows, and every fire
//! (or operator run-now) goes through [`JobExecutor`], which records a
//! [`JobRun`] and serializes executions across replicas with a named lock.
//!
//! ```text
//! job_definitions ──► CronReconciler ──► LiveScheduler (tokio-cron-scheduler)
//!                                              │ fire
//! run-now ────────────────────────────────────►│
//!                                              ▼
//!                                  JobExecutor ──► JobHandler (by func_key)
//!                                       │
//!                                       └─► job_runs
//! ```

pub mod executor;
pub mod handle;
pub mod handlers;
pub mod jobs;
pub mod live;
pub mod models;
pub mod reconciler;
pub mod store;

pub use executor::{JobExecutor, RunReport, DEFAULT_LOCK_TTL};
pub use handle::{JobOverview, SchedulerHandle, SchedulerStatus, DEFAULT_RECONCILE_INTERVAL};
pub use handlers::{JobHandler, JobHandlerRegistry, SchedulerError};
pub use jobs::register_builtin_jobs;
pub use live::{plan_fires, CronLiveScheduler, LiveScheduler, RecordingLiveScheduler};
pub use models::{JobDefinition, JobRun, NewJobDefinition, RunStatus};
pub use reconciler::{CronReconciler, ReconcileSummary};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore};
