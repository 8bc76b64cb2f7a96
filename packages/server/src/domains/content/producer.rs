//! Series producer: turns due series into `plan_next` work items.
//!
//! Runs as the `series.enqueue_due` cron job. Due rows are locked with
//! `FOR UPDATE SKIP LOCKED`, so two producers running at once split the due
//! series between them instead of enqueueing an episode twice.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::handlers::{PlanNext, PLAN_NEXT};
use super::models::Series;
use crate::kernel::cadence;
use crate::kernel::jobs::{insert_work_item, NewWorkItem, WorkItem};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProducerSummary {
    pub enqueued: Vec<EnqueuedEpisode>,
    pub invalid: Vec<InvalidSeries>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueuedEpisode {
    pub series_id: i64,
    pub episode_no: i32,
    pub work_item_id: Uuid,
    pub next_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidSeries {
    pub series_id: i64,
    pub error: String,
}

/// What a due series turns into.
#[derive(Debug, Clone)]
pub struct PlannedEpisode {
    pub episode_no: i32,
    pub next_run_at: DateTime<Utc>,
    pub item: WorkItem,
}

/// Next episode of `series` at `now`. Missed runs collapse into this one:
/// `next_run_at` is the first cadence fire strictly after `now`.
pub fn plan_episode(series: &Series, now: DateTime<Utc>) -> Result<PlannedEpisode> {
    let next_run_at = cadence::next_fire(now, &series.cadence)
        .with_context(|| format!("invalid cadence {:?}", series.cadence))?;
    let episode_no = series.episode_count + 1;
    let payload = PlanNext {
        series_id: series.id,
        episode_no,
        series_title: series.title.clone(),
        seed_topic: series.seed_topic.clone(),
    };
    let payload = serde_json::to_value(&payload).context("failed to encode plan_next payload")?;
    let item = NewWorkItem::builder()
        .kind(PLAN_NEXT)
        .payload(payload)
        .build()
        .into_item(now);

    Ok(PlannedEpisode {
        episode_no,
        next_run_at,
        item,
    })
}

/// Enqueue one `plan_next` item per due active series, in one transaction.
/// A series whose cadence does not parse is reported and left untouched.
pub async fn enqueue_due_series(pool: &PgPool, now: DateTime<Utc>) -> Result<ProducerSummary> {
    let mut tx = pool.begin().await?;

    let due = sqlx::query_as::<_, Series>(
        r#"
        SELECT * FROM series
        WHERE status = 'active' AND next_run_at <= $1
        ORDER BY next_run_at, id
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    let mut summary = ProducerSummary::default();

    for series in due {
        let planned = match plan_episode(&series, now) {
            Ok(planned) => planned,
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(series_id = series.id, error = %error, "series could not be planned");
                summary.invalid.push(InvalidSeries {
                    series_id: series.id,
                    error,
                });
                continue;
            }
        };

        sqlx::query(
            r#"
            UPDATE series
            SET next_run_at = $2, episode_count = $3
            WHERE id = $1
            "#,
        )
        .bind(series.id)
        .bind(planned.next_run_at)
        .bind(planned.episode_no)
        .execute(&mut *tx)
        .await?;

        insert_work_item(&mut *tx, &planned.item).await?;

        info!(
            series_id = series.id,
            episode_no = planned.episode_no,
            work_item_id = %planned.item.id,
            next_run_at = %planned.next_run_at,
            "episode enqueued"
        );
        summary.enqueued.push(EnqueuedEpisode {
            series_id: series.id,
            episode_no: planned.episode_no,
            work_item_id: planned.item.id,
            next_run_at: planned.next_run_at,
        });
    }

    tx.commit().await?;
    Ok(summary)
}
