//! Storage for job definitions and their run history.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use super::models::job_run::stored_run_error;
use super::models::{JobDefinition, JobRun, NewJobDefinition, RunStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn fetch_enabled(&self) -> Result<Vec<JobDefinition>>;

    async fn get(&self, job_id: &str) -> Result<Option<JobDefinition>>;

    async fn list(&self) -> Result<Vec<JobDefinition>>;

    /// Open a `running` run row and return its id.
    async fn create_run(
        &self,
        job_id: &str,
        scheduled_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// Finalize a run. Returns false when the run was already finalized.
    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        result: Option<Value>,
        error_text: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Most recent runs first.
    async fn recent_runs(&self, limit: i64) -> Result<Vec<JobRun>>;

    /// Latest run of each job.
    async fn last_runs(&self) -> Result<Vec<JobRun>>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn fetch_enabled(&self) -> Result<Vec<JobDefinition>> {
        JobDefinition::find_enabled(&self.pool).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobDefinition>> {
        JobDefinition::find_by_id(job_id, &self.pool).await
    }

    async fn list(&self) -> Result<Vec<JobDefinition>> {
        JobDefinition::find_all(&self.pool).await
    }

    async fn create_run(
        &self,
        job_id: &str,
        scheduled_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        JobRun::create(job_id, scheduled_time, now, &self.pool).await
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        result: Option<Value>,
        error_text: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        JobRun::finish(run_id, status, result.as_ref(), error_text, now, &self.pool).await
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<JobRun>> {
        JobRun::find_recent(limit, &self.pool).await
    }

    async fn last_runs(&self) -> Result<Vec<JobRun>> {
        JobRun::find_last_per_job(&self.pool).await
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
struct MemoryState {
    definitions: BTreeMap<String, JobDefinition>,
    runs: Vec<JobRun>,
}

/// Job store kept in process memory, for tests and local tooling.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition, bumping `version` on replace.
    pub fn upsert(&self, new: NewJobDefinition) -> JobDefinition {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let previous = state.definitions.get(&new.id).cloned();
        let mut definition = new.into_definition(1, now);
        if let Some(previous) = previous {
            definition.version = previous.version + 1;
            definition.created_at = previous.created_at;
        }
        state
            .definitions
            .insert(definition.id.clone(), definition.clone());
        definition
    }

    pub fn set_enabled(&self, job_id: &str, enabled: bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.definitions.get_mut(job_id) {
            Some(job) if job.enabled != enabled => {
                job.enabled = enabled;
                job.version += 1;
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, job_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.definitions.remove(job_id).is_some()
    }

    /// Every run of `job_id`, oldest first.
    pub fn runs_for(&self, job_id: &str) -> Vec<JobRun> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .runs
            .iter()
            .filter(|run| run.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Every run, oldest first.
    pub fn runs(&self) -> Vec<JobRun> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.runs.clone()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn fetch_enabled(&self) -> Result<Vec<JobDefinition>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .definitions
            .values()
            .filter(|job| job.enabled)
            .cloned()
            .collect())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobDefinition>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.definitions.get(job_id).cloned())
    }

    async fn list(&self) -> Result<Vec<JobDefinition>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.definitions.values().cloned().collect())
    }

    async fn create_run(
        &self,
        job_id: &str,
        scheduled_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.runs.len() as i64 + 1;
        state.runs.push(JobRun {
            id,
            job_id: job_id.to_string(),
            scheduled_time,
            start_time: now,
            end_time: None,
            status: RunStatus::Running,
            result: None,
            error_text: None,
        });
        Ok(id)
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        result: Option<Value>,
        error_text: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.runs.iter_mut().find(|run| run.id == run_id) {
            Some(run) if !run.is_finished() => {
                run.status = status;
                run.result = result;
                run.error_text = error_text.map(stored_run_error);
                run.end_time = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<JobRun>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let limit = limit.max(0) as usize;
        Ok(state.runs.iter().rev().take(limit).cloned().collect())
    }

    async fn last_runs(&self) -> Result<Vec<JobRun>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut last: BTreeMap<&str, &JobRun> = BTreeMap::new();
        for run in &state.runs {
            last.insert(run.job_id.as_str(), run);
        }
        Ok(last.into_values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job(id: &str) -> NewJobDefinition {
        NewJobDefinition::builder()
            .id(id)
            .name(id)
            .func_key("example.batch")
            .cron_expr("*/5 * * * *")
            .build()
    }

    #[tokio::test]
    async fn upsert_bumps_version() {
        let store = InMemoryJobStore::new();
        assert_eq!(store.upsert(new_job("a")).version, 1);
        assert_eq!(store.upsert(new_job("a")).version, 2);
        assert_eq!(store.get("a").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn fetch_enabled_skips_disabled() {
        let store = InMemoryJobStore::new();
        store.upsert(new_job("a"));
        store.upsert(new_job("b"));
        assert!(store.set_enabled("b", false));
        assert!(!store.set_enabled("b", false));

        let enabled = store.fetch_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "a");
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn runs_finalize_exactly_once() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let run_id = store.create_run("a", Some(now), now).await.unwrap();

        assert!(store
            .finish_run(run_id, RunStatus::Ok, Some(json!({"n": 1})), None, now)
            .await
            .unwrap());
        assert!(!store
            .finish_run(run_id, RunStatus::Error, None, Some("late"), now)
            .await
            .unwrap());

        let run = &store.runs_for("a")[0];
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.result, Some(json!({"n": 1})));
        assert!(run.error_text.is_none());
    }

    #[tokio::test]
    async fn recent_and_last_runs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let first = store.create_run("a", None, now).await.unwrap();
        let _other = store.create_run("b", None, now).await.unwrap();
        let latest = store.create_run("a", None, now).await.unwrap();

        let recent = store.recent_runs(2).await.unwrap();
        assert_eq!(recent.iter().map(|r| r.id).collect::<Vec<_>>(), vec![latest, 2]);

        let last = store.last_runs().await.unwrap();
        assert_eq!(last.len(), 2);
        let a = last.iter().find(|r| r.job_id == "a").unwrap();
        assert_eq!(a.id, latest);
        assert_ne!(a.id, first);
    }
}
