//! In-memory work-item queue for tests and local tooling.
//!
//! Every operation runs inside one mutex section, which gives the same
//! atomicity the Postgres queue gets from single statements.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::queue::WorkItemQueue;
use super::work_item::{stored_error, FailureKind, NewWorkItem, WorkItem, WorkItemStatus};

#[derive(Default)]
pub struct InMemoryWorkItemQueue {
    items: Mutex<HashMap<Uuid, WorkItem>>,
}

impl InMemoryWorkItemQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every item, oldest first.
    pub fn all(&self) -> Vec<WorkItem> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<WorkItem> = items.values().cloned().collect();
        all.sort_by(|a, b| (a.scheduled_at, a.id).cmp(&(b.scheduled_at, b.id)));
        all
    }

    pub fn with_kind(&self, kind: &str) -> Vec<WorkItem> {
        self.all().into_iter().filter(|i| i.kind == kind).collect()
    }
}

#[async_trait]
impl WorkItemQueue for InMemoryWorkItemQueue {
    async fn enqueue(&self, item: NewWorkItem) -> Result<Uuid> {
        let item = item.into_item(Utc::now());
        let id = item.id;
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, item);
        Ok(id)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<WorkItem>> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());

        let next_id = items
            .values()
            .filter(|i| i.is_eligible(now))
            .min_by(|a, b| (a.scheduled_at, a.id).cmp(&(b.scheduled_at, b.id)))
            .map(|i| i.id);

        Ok(next_id.and_then(|id| items.get_mut(&id)).map(|item| {
            item.status = WorkItemStatus::Running;
            item.started_at = Some(now);
            item.updated_at = now;
            item.clone()
        }))
    }

    async fn mark_done(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        match items.get_mut(&id) {
            Some(item) if item.status == WorkItemStatus::Running => {
                item.status = WorkItemStatus::Done;
                item.finished_at = Some(now);
                item.last_error = None;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let Some(item) = items.get_mut(&id) else {
            return Ok(None);
        };
        if item.status != WorkItemStatus::Running {
            return Ok(None);
        }

        item.attempts += 1;
        item.last_error = Some(stored_error(error));
        item.updated_at = now;
        if kind.is_terminal() || item.is_exhausted() {
            item.status = WorkItemStatus::Failed;
            item.finished_at = Some(now);
        } else {
            item.status = WorkItemStatus::Queued;
            item.finished_at = None;
            item.available_at = retry_at.max(item.scheduled_at);
        }

        Ok(Some(item.clone()))
    }

    async fn find(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items.get(&id).cloned())
    }

    async fn requeue_stale(&self, started_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for item in items.values_mut() {
            let stale = item.status == WorkItemStatus::Running
                && item.started_at.map(|t| t < started_before).unwrap_or(false);
            if stale {
                item.status = WorkItemStatus::Queued;
                item.started_at = None;
                item.available_at = now.max(item.scheduled_at);
                item.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn echo() -> NewWorkItem {
        NewWorkItem::builder().kind("echo").payload(json!({"n": 1})).build()
    }

    #[tokio::test]
    async fn claim_takes_oldest_and_marks_running() {
        let queue = InMemoryWorkItemQueue::new();
        let first = queue.enqueue(echo()).await.unwrap();
        let _second = queue.enqueue(echo()).await.unwrap();

        let claimed = queue.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, WorkItemStatus::Running);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn future_items_are_not_claimed() {
        let queue = InMemoryWorkItemQueue::new();
        let later = Utc::now() + Duration::minutes(10);
        queue
            .enqueue(NewWorkItem::builder().kind("echo").available_at(later).build())
            .await
            .unwrap();

        assert!(queue.claim_next(Utc::now()).await.unwrap().is_none());
        assert!(queue.claim_next(later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_delay() {
        let queue = InMemoryWorkItemQueue::new();
        let id = queue.enqueue(echo()).await.unwrap();
        let now = Utc::now();
        queue.claim_next(now).await.unwrap().unwrap();

        let retry_at = now + Duration::seconds(60);
        let item = queue
            .mark_failed(id, "boom", FailureKind::Retryable, retry_at, now)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(item.status, WorkItemStatus::Queued);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.available_at, retry_at);
        assert!(item.finished_at.is_none());
        assert!(queue.claim_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal() {
        let queue = InMemoryWorkItemQueue::new();
        let id = queue.enqueue(echo()).await.unwrap();
        let now = Utc::now();
        queue.claim_next(now).await.unwrap().unwrap();

        let item = queue
            .mark_failed(id, "bad payload", FailureKind::NonRetryable, now, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.status, WorkItemStatus::Failed);
        assert_eq!(item.finished_at, Some(now));
    }

    #[tokio::test]
    async fn transitions_require_running() {
        let queue = InMemoryWorkItemQueue::new();
        let id = queue.enqueue(echo()).await.unwrap();
        let now = Utc::now();

        assert!(!queue.mark_done(id, now).await.unwrap());
        assert!(queue
            .mark_failed(id, "x", FailureKind::Retryable, now, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn requeue_stale_only_touches_old_running_items() {
        let queue = InMemoryWorkItemQueue::new();
        let stale = queue.enqueue(echo()).await.unwrap();
        let t0 = Utc::now();
        queue.claim_next(t0).await.unwrap().unwrap();

        let fresh = queue.enqueue(echo()).await.unwrap();
        let t1 = t0 + Duration::hours(1);
        queue.claim_next(t1).await.unwrap().unwrap();

        let moved = queue
            .requeue_stale(t0 + Duration::minutes(30), t1)
            .await
            .unwrap();
        assert_eq!(moved, 1);

        let stale = queue.find(stale).await.unwrap().unwrap();
        assert_eq!(stale.status, WorkItemStatus::Queued);
        assert!(stale.started_at.is_none());
        let fresh = queue.find(fresh).await.unwrap().unwrap();
        assert_eq!(fresh.status, WorkItemStatus::Running);
    }
}
