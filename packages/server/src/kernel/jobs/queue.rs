//! PostgreSQL-backed work-item queue.
//!
//! Every state transition is one statement. Claims use `FOR UPDATE SKIP
//! LOCKED`, so concurrent workers never block on a row another worker is in
//! the middle of claiming; they simply move on to the next eligible row.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::work_item::{stored_error, FailureKind, NewWorkItem, WorkItem};

const COLUMNS: &str = "id, kind, payload, scheduled_at, available_at, started_at, finished_at, \
                       status, attempts, max_attempts, last_error, created_at, updated_at";

/// Storage contract of the work-item queue.
///
/// Implementations must make `claim_next` and `mark_failed` atomic: two
/// concurrent claims never return the same row.
#[async_trait]
pub trait WorkItemQueue: Send + Sync {
    /// Insert a queued item. `available_at` is clamped to the enqueue time.
    async fn enqueue(&self, item: NewWorkItem) -> Result<Uuid>;

    /// Claim the oldest eligible item by `(scheduled_at, id)` and mark it
    /// running.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<WorkItem>>;

    /// `running -> done`. Returns false when the item was not running.
    async fn mark_done(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Record a failed attempt. The item goes back to `queued` with
    /// `available_at = retry_at`, or to `failed` once attempts are used up or
    /// the failure is non-retryable. `None` when the item was not running.
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>>;

    async fn find(&self, id: Uuid) -> Result<Option<WorkItem>>;

    /// Put items stuck in `running` since before `started_before` back in the
    /// queue. Operator action only; workers never call it.
    async fn requeue_stale(&self, started_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;
}

pub struct PostgresWorkItemQueue {
    pool: PgPool,
}

impl PostgresWorkItemQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Insert a fully materialized item with any executor, so producers can
/// enqueue inside their own transaction.
pub async fn insert_work_item<'e, E>(executor: E, item: &WorkItem) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO work_items (id, kind, payload, scheduled_at, available_at, status,
                                attempts, max_attempts, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(item.id)
    .bind(&item.kind)
    .bind(&item.payload)
    .bind(item.scheduled_at)
    .bind(item.available_at)
    .bind(item.status)
    .bind(item.attempts)
    .bind(item.max_attempts)
    .bind(item.created_at)
    .bind(item.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl WorkItemQueue for PostgresWorkItemQueue {
    async fn enqueue(&self, item: NewWorkItem) -> Result<Uuid> {
        let item = item.into_item(Utc::now());
        insert_work_item(&self.pool, &item).await?;
        debug!(work_item_id = %item.id, kind = %item.kind, "work item enqueued");
        Ok(item.id)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<WorkItem>> {
        let item = sqlx::query_as::<_, WorkItem>(&format!(
            r#"
            WITH next_item AS (
                SELECT id
                FROM work_items
                WHERE status = 'queued' AND available_at <= $1
                ORDER BY scheduled_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items
            SET status = 'running',
                started_at = $1,
                updated_at = $1
            FROM next_item
            WHERE work_items.id = next_item.id
            RETURNING {}
            "#,
            qualified_columns("work_items")
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    async fn mark_done(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'done',
                finished_at = $2,
                last_error = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        // Column references on the right-hand side see the pre-update row.
        let item = sqlx::query_as::<_, WorkItem>(&format!(
            r#"
            UPDATE work_items
            SET attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN $3 OR attempts + 1 >= max_attempts
                              THEN 'failed'::work_item_status
                              ELSE 'queued'::work_item_status END,
                finished_at = CASE WHEN $3 OR attempts + 1 >= max_attempts
                                   THEN $5 ELSE NULL END,
                available_at = CASE WHEN $3 OR attempts + 1 >= max_attempts
                                    THEN available_at
                                    ELSE GREATEST($4, scheduled_at) END,
                updated_at = $5
            WHERE id = $1 AND status = 'running'
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(stored_error(error))
        .bind(kind.is_terminal())
        .bind(retry_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    async fn find(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let item = sqlx::query_as::<_, WorkItem>(&format!(
            "SELECT {} FROM work_items WHERE id = $1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    async fn requeue_stale(&self, started_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'queued',
                started_at = NULL,
                available_at = GREATEST($2, scheduled_at),
                updated_at = $2
            WHERE status = 'running' AND started_at < $1
            "#,
        )
        .bind(started_before)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// `COLUMNS` prefixed with a table name, for `UPDATE ... FROM` statements
/// where bare names would be ambiguous.
fn qualified_columns(table: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{}.{}", table, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_columns_prefixes_every_column() {
        let cols = qualified_columns("w");
        assert!(cols.starts_with("w.id, w.kind, w.payload"));
        assert!(cols.ends_with("w.updated_at"));
        assert_eq!(cols.matches("w.").count(), COLUMNS.split(',').count());
    }
}
