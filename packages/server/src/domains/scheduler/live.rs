//! The in-process cron scheduler that registered jobs fire from.
//!
//! [`CronLiveScheduler`] runs on `tokio-cron-scheduler`. Every tick is
//! turned into concrete fires by [`plan_fires`], which applies the
//! registration's misfire grace and coalescing; `max_instances` is a
//! semaphore per registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handlers::SchedulerError;
use super::models::JobDefinition;
use crate::kernel::Cadence;

/// Callback invoked for each fire with the job id and its scheduled time.
pub type FireFn = Arc<dyn Fn(String, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

/// How a job definition is registered in the live scheduler.
#[derive(Debug, Clone)]
pub struct Registration {
    pub job_id: String,
    pub version: i64,
    pub cadence: Cadence,
    pub coalesce: bool,
    pub max_instances: usize,
    pub misfire_grace: Duration,
}

impl Registration {
    /// Validates the cron expression; an invalid one is a configuration
    /// error.
    pub fn from_definition(job: &JobDefinition) -> Result<Self, SchedulerError> {
        let cadence = Cadence::parse(&job.cron_expr).map_err(|source| SchedulerError::InvalidCron {
            job_id: job.id.clone(),
            source,
        })?;
        Ok(Self {
            job_id: job.id.clone(),
            version: job.version,
            cadence,
            coalesce: job.coalesce,
            max_instances: job.max_instances(),
            misfire_grace: job.misfire_grace(),
        })
    }

    pub fn summary(&self) -> RegisteredJob {
        RegisteredJob {
            job_id: self.job_id.clone(),
            version: self.version,
            cron_expr: self.cadence.source().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredJob {
    pub job_id: String,
    pub version: i64,
    pub cron_expr: String,
}

#[async_trait]
pub trait LiveScheduler: Send + Sync {
    /// Register `registration`, replacing any earlier registration of the
    /// same job id.
    async fn register(&self, registration: Registration, fire: FireFn) -> Result<()>;

    /// Returns false when the job was not registered.
    async fn deregister(&self, job_id: &str) -> Result<bool>;

    /// Current registrations, sorted by job id.
    fn registered(&self) -> Vec<RegisteredJob>;

    async fn shutdown(&self) -> Result<()>;
}

/// Fires to run for a tick at `now`, given the oldest fire not yet run.
///
/// Every cadence fire in `[expected, now]` is due. Fires later than
/// `misfire_grace` (whole seconds) are dropped; with `coalesce` only the most
/// recent remaining fire runs.
pub fn plan_fires(
    expected: DateTime<Utc>,
    now: DateTime<Utc>,
    cadence: &Cadence,
    coalesce: bool,
    misfire_grace: Duration,
) -> Vec<DateTime<Utc>> {
    if expected > now {
        return Vec::new();
    }

    let grace_secs = misfire_grace.as_secs() as i64;
    let due = std::iter::once(expected).chain(cadence.fires_between(expected, now));
    let mut fires: Vec<DateTime<Utc>> = due
        .filter(|fire| (now - *fire).num_seconds() <= grace_secs)
        .collect();

    if coalesce {
        fires = fires.pop().into_iter().collect();
    }
    fires
}

// =============================================================================
// tokio-cron-scheduler
// =============================================================================

struct FireGate {
    registration: Registration,
    expected: Mutex<Option<DateTime<Utc>>>,
    instances: Arc<Semaphore>,
    fire: FireFn,
}

impl FireGate {
    fn new(registration: Registration, fire: FireFn, now: DateTime<Utc>) -> Self {
        let expected = registration.cadence.next_fire(now);
        let instances = Arc::new(Semaphore::new(registration.max_instances));
        Self {
            registration,
            expected: Mutex::new(expected),
            instances,
            fire,
        }
    }

    fn on_tick(&self, now: DateTime<Utc>) {
        let reg = &self.registration;
        let fires = {
            let mut expected = self.expected.lock().unwrap_or_else(|e| e.into_inner());
            let Some(first) = *expected else {
                return;
            };
            let fires = plan_fires(first, now, &reg.cadence, reg.coalesce, reg.misfire_grace);
            if first <= now {
                *expected = reg.cadence.next_fire(now);
            }
            fires
        };

        if fires.is_empty() {
            debug!(job_id = %reg.job_id, "tick with no fire inside the misfire grace");
        }

        for scheduled_time in fires {
            let Ok(permit) = self.instances.clone().try_acquire_owned() else {
                warn!(
                    job_id = %reg.job_id,
                    max_instances = reg.max_instances,
                    scheduled_time = %scheduled_time,
                    "max instances reached, fire dropped"
                );
                continue;
            };
            let fire = (self.fire)(reg.job_id.clone(), scheduled_time);
            tokio::spawn(async move {
                fire.await;
                drop(permit);
            });
        }
    }
}

struct CronEntry {
    uuid: Uuid,
    registration: Registration,
}

/// Live scheduler backed by `tokio-cron-scheduler`, in UTC.
pub struct CronLiveScheduler {
    scheduler: JobScheduler,
    entries: Mutex<HashMap<String, CronEntry>>,
}

impl CronLiveScheduler {
    pub async fn start() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        scheduler.start().await?;
        info!("cron scheduler started");
        Ok(Self {
            scheduler,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn take_entry(&self, job_id: &str) -> Option<CronEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id)
    }
}

#[async_trait]
impl LiveScheduler for CronLiveScheduler {
    async fn register(&self, registration: Registration, fire: FireFn) -> Result<()> {
        if let Some(previous) = self.take_entry(&registration.job_id) {
            self.scheduler.remove(&previous.uuid).await?;
        }

        let gate = Arc::new(FireGate::new(registration.clone(), fire, Utc::now()));
        let job = Job::new_async(registration.cadence.scheduler_expression(), move |_uuid, _lock| {
            let gate = gate.clone();
            Box::pin(async move {
                gate.on_tick(Utc::now());
            })
        })?;
        let uuid = self.scheduler.add(job).await?;

        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(registration.job_id.clone(), CronEntry { uuid, registration });
        Ok(())
    }

    async fn deregister(&self, job_id: &str) -> Result<bool> {
        match self.take_entry(job_id) {
            Some(entry) => {
                self.scheduler.remove(&entry.uuid).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn registered(&self) -> Vec<RegisteredJob> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<RegisteredJob> = entries
            .values()
            .map(|entry| entry.registration.summary())
            .collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    async fn shutdown(&self) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        info!("cron scheduler stopped");
        Ok(())
    }
}

// =============================================================================
// Recording (tests, dry runs)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Registered { job_id: String, version: i64, cron_expr: String },
    Deregistered { job_id: String },
    Shutdown,
}

/// Live scheduler that never fires by itself. Tests drive fires with
/// [`RecordingLiveScheduler::fire`] and inspect the registration history.
#[derive(Default)]
pub struct RecordingLiveScheduler {
    entries: Mutex<HashMap<String, (Registration, FireFn)>>,
    history: Mutex<Vec<LiveEvent>>,
}

impl RecordingLiveScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<LiveEvent> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// How many times `job_id` was (re)registered.
    pub fn registrations_of(&self, job_id: &str) -> usize {
        self.history()
            .iter()
            .filter(|event| matches!(event, LiveEvent::Registered { job_id: id, .. } if id == job_id))
            .count()
    }

    /// Fire `job_id` as if its trigger went off at `scheduled_time`, and wait
    /// for the execution. Returns false when nothing is registered.
    pub async fn fire(&self, job_id: &str, scheduled_time: DateTime<Utc>) -> bool {
        let fire = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.get(job_id).map(|(_, fire)| fire.clone())
        };
        match fire {
            Some(fire) => {
                fire(job_id.to_string(), scheduled_time).await;
                true
            }
            None => false,
        }
    }

    fn record(&self, event: LiveEvent) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[async_trait]
impl LiveScheduler for RecordingLiveScheduler {
    async fn register(&self, registration: Registration, fire: FireFn) -> Result<()> {
        let summary = registration.summary();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(registration.job_id.clone(), (registration, fire));
        self.record(LiveEvent::Registered {
            job_id: summary.job_id,
            version: summary.version,
            cron_expr: summary.cron_expr,
        });
        Ok(())
    }

    async fn deregister(&self, job_id: &str) -> Result<bool> {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id)
            .is_some();
        if removed {
            self.record(LiveEvent::Deregistered {
                job_id: job_id.to_string(),
            });
        }
        Ok(removed)
    }

    fn registered(&self) -> Vec<RegisteredJob> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<RegisteredJob> = entries.values().map(|(reg, _)| reg.summary()).collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    async fn shutdown(&self) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.record(LiveEvent::Shutdown);
        Ok(())
    }
}
