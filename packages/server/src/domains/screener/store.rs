//! Topic persistence for the screener.
//!
//! Every write that changes a topic's status is a single conditional update
//! (`WHERE status = 'new'`). Concurrent screeners racing for the same row see
//! exactly one `true`; the rest see `false` and count a conflict.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;

use super::models::{NewTopic, Topic, TopicStatus};
use crate::common::truncate_chars;

/// Error messages annotated onto a topic are cut to this many characters.
pub const MAX_ANNOTATION_CHARS: usize = 500;

#[async_trait]
pub trait TopicStore: Send + Sync {
    /// Oldest `new` topic by `(coalesce(published_at, collected_at), id)`.
    async fn fetch_oldest_new(&self) -> Result<Option<Topic>>;

    /// Move a `new` topic to `to` and merge `screener_meta` into
    /// `payload.screener`. `false` when the topic was no longer `new`.
    async fn transition_from_new(
        &self,
        id: i64,
        to: TopicStatus,
        screener_meta: Value,
    ) -> Result<bool>;

    /// Append `{stage, message, ts}` to `payload.errors`; status untouched.
    async fn annotate_error(&self, id: i64, stage: &str, message: &str) -> Result<()>;
}

fn error_annotation(stage: &str, message: &str) -> Value {
    json!({
        "stage": stage,
        "message": truncate_chars(message, MAX_ANNOTATION_CHARS),
        "ts": Utc::now().timestamp(),
    })
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PostgresTopicStore {
    pool: PgPool,
}

impl PostgresTopicStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TopicStore for PostgresTopicStore {
    async fn fetch_oldest_new(&self) -> Result<Option<Topic>> {
        Topic::find_oldest_new(&self.pool).await
    }

    async fn transition_from_new(
        &self,
        id: i64,
        to: TopicStatus,
        screener_meta: Value,
    ) -> Result<bool> {
        Topic::transition_from_new(id, to, &screener_meta, &self.pool).await
    }

    async fn annotate_error(&self, id: i64, stage: &str, message: &str) -> Result<()> {
        Topic::append_error(id, &error_annotation(stage, message), &self.pool).await
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Same contract as the Postgres store; each operation runs inside one
/// mutex section.
#[derive(Default)]
pub struct InMemoryTopicStore {
    topics: Mutex<BTreeMap<i64, Topic>>,
}

impl InMemoryTopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, new: NewTopic) -> Topic {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let id = topics.keys().next_back().copied().unwrap_or(0) + 1;
        let topic = Topic {
            id,
            title: new.title,
            summary: new.summary,
            url: new.url,
            status: TopicStatus::New,
            payload: None,
            published_at: new.published_at,
            collected_at: now,
            updated_at: now,
        };
        topics.insert(id, topic.clone());
        topic
    }

    pub fn get(&self, id: i64) -> Option<Topic> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn with_status(&self, status: TopicStatus) -> Vec<Topic> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }
}

/// `target[key] ||= patch`; non-object values are replaced.
fn merge_object(target: &mut Value, key: &str, patch: Value) {
    if !target.is_object() {
        *target = json!({});
    }
    let slot = &mut target[key];
    if !slot.is_object() {
        *slot = json!({});
    }
    if let (Some(existing), Value::Object(patch)) = (slot.as_object_mut(), patch) {
        existing.extend(patch);
    }
}

fn push_array(target: &mut Value, key: &str, item: Value) {
    if !target.is_object() {
        *target = json!({});
    }
    let slot = &mut target[key];
    if !slot.is_array() {
        *slot = json!([]);
    }
    if let Some(list) = slot.as_array_mut() {
        list.push(item);
    }
}

#[async_trait]
impl TopicStore for InMemoryTopicStore {
    async fn fetch_oldest_new(&self) -> Result<Option<Topic>> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        Ok(topics
            .values()
            .filter(|t| t.status == TopicStatus::New)
            .min_by_key(|t| t.age_key())
            .cloned())
    }

    async fn transition_from_new(
        &self,
        id: i64,
        to: TopicStatus,
        screener_meta: Value,
    ) -> Result<bool> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(topic) = topics.get_mut(&id).filter(|t| t.status == TopicStatus::New) else {
            return Ok(false);
        };

        let payload = topic.payload.get_or_insert_with(|| json!({}));
        merge_object(payload, "screener", screener_meta);

        topic.status = to;
        topic.updated_at = Utc::now();
        Ok(true)
    }

    async fn annotate_error(&self, id: i64, stage: &str, message: &str) -> Result<()> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(topic) = topics.get_mut(&id) {
            let payload = topic.payload.get_or_insert_with(|| json!({}));
            push_array(payload, "errors", error_annotation(stage, message));
            topic.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn oldest_by_publication_then_id() {
        let store = InMemoryTopicStore::new();
        store.insert(
            NewTopic::builder()
                .title("newer")
                .published_at(Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap())
                .build(),
        );
        let older = store.insert(
            NewTopic::builder()
                .title("older")
                .published_at(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
                .build(),
        );

        let next = store.fetch_oldest_new().await.unwrap().unwrap();
        assert_eq!(next.id, older.id);
    }

    #[tokio::test]
    async fn transition_only_moves_new_rows() {
        let store = InMemoryTopicStore::new();
        let topic = store.insert(NewTopic::builder().title("a title").build());

        assert!(store
            .transition_from_new(topic.id, TopicStatus::Claimed, json!({ "score": 80 }))
            .await
            .unwrap());
        assert!(!store
            .transition_from_new(topic.id, TopicStatus::Skipped, json!({ "score": 1 }))
            .await
            .unwrap());

        let stored = store.get(topic.id).unwrap();
        assert_eq!(stored.status, TopicStatus::Claimed);
        assert_eq!(stored.payload.unwrap()["screener"]["score"], 80);
    }

    #[tokio::test]
    async fn missing_topic_is_not_transitioned() {
        let store = InMemoryTopicStore::new();
        assert!(!store
            .transition_from_new(42, TopicStatus::Claimed, json!({}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn errors_accumulate_without_status_change() {
        let store = InMemoryTopicStore::new();
        let topic = store.insert(NewTopic::builder().title("a title").build());
        let long = "x".repeat(MAX_ANNOTATION_CHARS + 50);

        store.annotate_error(topic.id, "screen", "boom").await.unwrap();
        store.annotate_error(topic.id, "screen", &long).await.unwrap();

        let stored = store.get(topic.id).unwrap();
        assert_eq!(stored.status, TopicStatus::New);
        let errors = stored.payload.unwrap()["errors"].as_array().unwrap().clone();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0]["stage"], "screen");
        assert_eq!(errors[0]["message"], "boom");
        assert_eq!(
            errors[1]["message"].as_str().unwrap().chars().count(),
            MAX_ANNOTATION_CHARS
        );
    }
}
