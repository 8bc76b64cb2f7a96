use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// `series.status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesStatus {
    Active,
    Paused,
}

impl SeriesStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesStatus::Active => "active",
            SeriesStatus::Paused => "paused",
        }
    }
}

/// A recurring content series. `cadence` is a cron expression or
/// `DAILY@H[:MM]`; the producer advances `next_run_at` with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Series {
    pub id: i64,
    pub title: String,
    pub seed_topic: String,
    pub cadence: String,
    pub next_run_at: DateTime<Utc>,
    pub status: String,
    pub episode_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Series {
    pub fn is_active(&self) -> bool {
        self.status == SeriesStatus::Active.as_str()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.next_run_at <= now
    }

    pub async fn create(
        title: &str,
        seed_topic: &str,
        cadence: &str,
        next_run_at: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO series (title, seed_topic, cadence, next_run_at)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(title)
        .bind(seed_topic)
        .bind(cadence)
        .bind(next_run_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM series WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn set_status(id: i64, status: SeriesStatus, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query("UPDATE series SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
