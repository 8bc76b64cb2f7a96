//! Test fixtures for creating test data.
//!
//! These fixtures use the model methods directly. Ids are unique per call so
//! tests sharing the database do not see each other's rows.

use anyhow::Result;
use autopost_core::domains::content::models::Series;
use autopost_core::domains::scheduler::{JobDefinition, NewJobDefinition};
use autopost_core::domains::screener::models::{NewTopic, Topic};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// A string unique to this call, e.g. `"job-3f2a..."`.
pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

/// Insert a `new` topic with the given title and summary.
pub async fn create_test_topic(pool: &PgPool, title: &str, summary: Option<&str>) -> Result<Topic> {
    let new = match summary {
        Some(summary) => NewTopic::builder().title(title).summary(summary).build(),
        None => NewTopic::builder().title(title).build(),
    };
    Topic::create(&new, pool).await
}

/// Insert an active series due at `next_run_at`.
pub async fn create_test_series(
    pool: &PgPool,
    cadence: &str,
    next_run_at: DateTime<Utc>,
) -> Result<Series> {
    Series::create(
        &unique("series"),
        "rust tooling",
        cadence,
        next_run_at,
        pool,
    )
    .await
}

/// Upsert an enabled every-minute definition running `func_key`.
pub async fn create_test_job(
    pool: &PgPool,
    func_key: &str,
    lock_key: Option<&str>,
) -> Result<JobDefinition> {
    let id = unique("job");
    let new = match lock_key {
        Some(lock_key) => NewJobDefinition::builder()
            .id(id.clone())
            .name(id)
            .func_key(func_key)
            .cron_expr("* * * * *")
            .lock_key(lock_key)
            .build(),
        None => NewJobDefinition::builder()
            .id(id.clone())
            .name(id)
            .func_key(func_key)
            .cron_expr("* * * * *")
            .build(),
    };
    JobDefinition::upsert(&new, pool).await
}
