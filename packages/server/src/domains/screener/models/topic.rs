use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use typed_builder::TypedBuilder;

/// Only `new` topics may move, and only to `claimed` or `skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "topic_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    New,
    Claimed,
    Posted,
    Skipped,
}

/// A collected news topic waiting to be screened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    pub id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub status: TopicStatus,
    /// Screening decisions and errors accumulate here
    pub payload: Option<Value>,
    pub published_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewTopic {
    pub title: String,
    #[builder(default, setter(strip_option))]
    pub summary: Option<String>,
    #[builder(default, setter(strip_option))]
    pub url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub published_at: Option<DateTime<Utc>>,
}

impl Topic {
    /// Screening order: oldest first by publication (collection when
    /// unknown), then id.
    pub fn age_key(&self) -> (DateTime<Utc>, i64) {
        (self.published_at.unwrap_or(self.collected_at), self.id)
    }

    pub async fn create(new: &NewTopic, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO topics (title, summary, url, published_at)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&new.title)
        .bind(&new.summary)
        .bind(&new.url)
        .bind(new.published_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM topics WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_oldest_new(pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM topics
            WHERE status = 'new'
            ORDER BY COALESCE(published_at, collected_at) ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// `new -> to`, merging `screener_meta` into `payload.screener`.
    /// Zero rows affected means another consumer got there first.
    pub async fn transition_from_new(
        id: i64,
        to: TopicStatus,
        screener_meta: &Value,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE topics
            SET status = $2,
                payload = jsonb_set(
                    COALESCE(payload, '{}'::jsonb),
                    '{screener}',
                    COALESCE(payload -> 'screener', '{}'::jsonb) || $3::jsonb
                ),
                updated_at = NOW()
            WHERE id = $1 AND status = 'new'
            "#,
        )
        .bind(id)
        .bind(to)
        .bind(screener_meta)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Append `error` to `payload.errors` without touching the status.
    pub async fn append_error(id: i64, error: &Value, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE topics
            SET payload = jsonb_set(
                    COALESCE(payload, '{}'::jsonb),
                    '{errors}',
                    COALESCE(payload -> 'errors', '[]'::jsonb) || jsonb_build_array($2::jsonb)
                ),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }
}
