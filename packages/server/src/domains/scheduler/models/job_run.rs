use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use crate::common::truncate_chars;

/// `error_text` is stored truncated to this many characters.
pub const MAX_RUN_ERROR_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One execution of a job definition. Created `running` before anything else
/// happens and finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRun {
    pub id: i64,
    pub job_id: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error_text: Option<String>,
}

impl JobRun {
    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }

    pub async fn create(
        job_id: &str,
        scheduled_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_runs (job_id, scheduled_time, start_time, status)
            VALUES ($1, $2, $3, 'running')
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(scheduled_time)
        .bind(now)
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    /// Finalize a run. A run that is no longer `running` is left untouched.
    pub async fn finish(
        id: i64,
        status: RunStatus,
        result: Option<&Value>,
        error_text: Option<&str>,
        now: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, result = $3, error_text = $4, end_time = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(result)
        .bind(error_text.map(stored_run_error))
        .bind(now)
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    pub async fn find_recent(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM job_runs ORDER BY id DESC LIMIT $1")
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_for_job(job_id: &str, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM job_runs WHERE job_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Latest run of every job that has run at least once.
    pub async fn find_last_per_job(pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT DISTINCT ON (job_id) *
            FROM job_runs
            ORDER BY job_id, id DESC
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}

pub fn stored_run_error(error: &str) -> String {
    truncate_chars(error, MAX_RUN_ERROR_CHARS).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_database_labels() {
        assert_eq!(RunStatus::Ok.to_string(), "ok");
        assert_eq!(RunStatus::Skipped.to_string(), "skipped");
        assert_eq!(
            serde_json::to_value(RunStatus::Error).unwrap(),
            serde_json::json!("error")
        );
    }

    #[test]
    fn long_errors_are_truncated() {
        let long = "x".repeat(MAX_RUN_ERROR_CHARS + 10);
        assert_eq!(stored_run_error(&long).chars().count(), MAX_RUN_ERROR_CHARS);
    }
}
