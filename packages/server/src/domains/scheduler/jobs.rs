//! Built-in cron job handlers.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::info;

use super::handlers::{JobHandler, JobHandlerRegistry};
use crate::domains::content::enqueue_due_series;

pub const EXAMPLE_BATCH: &str = "example.batch";
pub const SERIES_ENQUEUE_DUE: &str = "series.enqueue_due";

const BATCH_STEP: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct BatchParams {
    #[serde(default = "default_topic")]
    topic: String,
    #[serde(default = "default_count")]
    count: u32,
}

fn default_topic() -> String {
    "default".to_string()
}

fn default_count() -> u32 {
    1
}

/// Demo job: processes `count` steps of `topic`.
pub async fn example_batch(params: Value) -> Result<Value> {
    let params: BatchParams = serde_json::from_value(params)?;
    info!(topic = %params.topic, count = params.count, "example batch started");
    for step in 1..=params.count {
        tokio::time::sleep(BATCH_STEP).await;
        info!(topic = %params.topic, step, count = params.count, "example batch step");
    }
    Ok(json!({ "status": "ok", "processed": params.count, "topic": params.topic }))
}

/// Runs the series producer.
pub struct EnqueueDueSeries {
    pool: PgPool,
}

impl EnqueueDueSeries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobHandler for EnqueueDueSeries {
    async fn run(&self, _params: Value) -> Result<Value> {
        let summary = enqueue_due_series(&self.pool, Utc::now()).await?;
        Ok(serde_json::to_value(summary)?)
    }
}

pub fn register_builtin_jobs(registry: &mut JobHandlerRegistry, pool: PgPool) {
    registry.register_fn(EXAMPLE_BATCH, example_batch);
    registry.register(SERIES_ENQUEUE_DUE, std::sync::Arc::new(EnqueueDueSeries::new(pool)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn example_batch_reports_processed_count() {
        let out = example_batch(json!({ "topic": "news", "count": 2 })).await.unwrap();
        assert_eq!(out, json!({ "status": "ok", "processed": 2, "topic": "news" }));
    }

    #[tokio::test]
    async fn example_batch_defaults() {
        let out = example_batch(json!({})).await.unwrap();
        assert_eq!(out["topic"], "default");
        assert_eq!(out["processed"], 1);
    }

    #[tokio::test]
    async fn example_batch_rejects_bad_params() {
        assert!(example_batch(json!({ "count": "many" })).await.is_err());
    }
}
