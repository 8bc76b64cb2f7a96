use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use typed_builder::TypedBuilder;

/// A recurring job as declared in `job_definitions`.
///
/// The reconciler only reads these rows; operators own them. Bumping
/// `version` is what makes a running scheduler pick up a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub func_key: String,
    pub cron_expr: String,
    pub params: Option<Value>,
    pub enabled: bool,
    /// Collapse missed fires into one
    #[sqlx(rename = "coalesce_missed")]
    pub coalesce: bool,
    pub max_instances: i32,
    /// Seconds late a fire may still run
    pub misfire_grace: i32,
    pub lock_key: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJobDefinition {
    pub id: String,
    pub name: String,
    pub func_key: String,
    pub cron_expr: String,
    #[builder(default, setter(strip_option))]
    pub params: Option<Value>,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default = true)]
    pub coalesce: bool,
    #[builder(default = 1)]
    pub max_instances: i32,
    #[builder(default = 300)]
    pub misfire_grace: i32,
    #[builder(default, setter(strip_option))]
    pub lock_key: Option<String>,
}

impl NewJobDefinition {
    pub fn into_definition(self, version: i64, now: DateTime<Utc>) -> JobDefinition {
        JobDefinition {
            id: self.id,
            name: self.name,
            func_key: self.func_key,
            cron_expr: self.cron_expr,
            params: self.params,
            enabled: self.enabled,
            coalesce: self.coalesce,
            max_instances: self.max_instances.max(1),
            misfire_grace: self.misfire_grace.max(0),
            lock_key: self.lock_key,
            version,
            created_at: now,
            updated_at: now,
        }
    }
}

impl JobDefinition {
    /// Lock serializing executions of this job across replicas.
    pub fn effective_lock_key(&self) -> String {
        match self.lock_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => format!("lock:{}", self.id),
        }
    }

    pub fn params_or_empty(&self) -> Value {
        self.params.clone().unwrap_or_else(|| json!({}))
    }

    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.misfire_grace.max(0) as u64)
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances.max(1) as usize
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn find_enabled(pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM job_definitions WHERE enabled = TRUE ORDER BY id",
        )
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM job_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_all(pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM job_definitions ORDER BY id")
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// Insert or replace a definition. Replacing bumps `version` so running
    /// schedulers re-register it on their next reconcile.
    pub async fn upsert(new: &NewJobDefinition, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO job_definitions (id, name, func_key, cron_expr, params, enabled,
                                         coalesce_missed, max_instances, misfire_grace, lock_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                func_key = EXCLUDED.func_key,
                cron_expr = EXCLUDED.cron_expr,
                params = EXCLUDED.params,
                enabled = EXCLUDED.enabled,
                coalesce_missed = EXCLUDED.coalesce_missed,
                max_instances = EXCLUDED.max_instances,
                misfire_grace = EXCLUDED.misfire_grace,
                lock_key = EXCLUDED.lock_key,
                version = job_definitions.version + 1,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(&new.id)
        .bind(&new.name)
        .bind(&new.func_key)
        .bind(&new.cron_expr)
        .bind(&new.params)
        .bind(new.enabled)
        .bind(new.coalesce)
        .bind(new.max_instances.max(1))
        .bind(new.misfire_grace.max(0))
        .bind(&new.lock_key)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_enabled(id: &str, enabled: bool, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_definitions
            SET enabled = $2, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND enabled <> $2
            "#,
        )
        .bind(id)
        .bind(enabled)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> JobDefinition {
        NewJobDefinition::builder()
            .id("nightly")
            .name("Nightly batch")
            .func_key("example.batch")
            .cron_expr("0 3 * * *")
            .build()
            .into_definition(1, Utc::now())
    }

    #[test]
    fn builder_defaults() {
        let job = definition();
        assert!(job.enabled);
        assert!(job.coalesce);
        assert_eq!(job.max_instances, 1);
        assert_eq!(job.misfire_grace(), Duration::from_secs(300));
        assert_eq!(job.params_or_empty(), json!({}));
    }

    #[test]
    fn lock_key_defaults_to_job_id() {
        let mut job = definition();
        assert_eq!(job.effective_lock_key(), "lock:nightly");

        job.lock_key = Some("  ".into());
        assert_eq!(job.effective_lock_key(), "lock:nightly");

        job.lock_key = Some("shared".into());
        assert_eq!(job.effective_lock_key(), "shared");
    }

    #[test]
    fn limits_are_clamped() {
        let job = NewJobDefinition::builder()
            .id("x")
            .name("x")
            .func_key("example.batch")
            .cron_expr("* * * * *")
            .max_instances(0)
            .misfire_grace(-5)
            .build()
            .into_definition(1, Utc::now());
        assert_eq!(job.max_instances(), 1);
        assert_eq!(job.misfire_grace(), Duration::ZERO);
    }
}
