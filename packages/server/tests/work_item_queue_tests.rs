//! Work-item queue integration tests.
//!
//! The in-memory tests run everywhere. The Postgres tests need docker and are
//! ignored by default: `cargo test -- --ignored`.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use autopost_core::kernel::jobs::{
    FailureKind, InMemoryWorkItemQueue, NewWorkItem, PostgresWorkItemQueue, WorkItemQueue,
    WorkItemRegistry, WorkItemRunner, WorkItemRunnerConfig, WorkItemStatus,
};
use autopost_core::kernel::{RetryPolicy, TestDependencies};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use test_context::test_context;

use crate::common::TestHarness;

#[derive(Debug, Deserialize)]
struct Flaky {
    #[allow(dead_code)]
    note: String,
}

fn always_failing_runner(queue: Arc<dyn WorkItemQueue>) -> WorkItemRunner {
    let mut registry = WorkItemRegistry::new();
    registry.register::<Flaky, _, _>("flaky", |_payload, _deps| async move {
        Err::<(), _>(anyhow::anyhow!("upstream unavailable"))
    });
    WorkItemRunner::new(
        queue,
        Arc::new(registry),
        Arc::new(TestDependencies::new().into_deps()),
        WorkItemRunnerConfig {
            poll_interval: Duration::from_millis(10),
            retry_policy: RetryPolicy::Fixed(Duration::ZERO),
            worker_id: "integration-worker".into(),
        },
    )
}

async fn claim_concurrently(queue: Arc<dyn WorkItemQueue>, workers: usize) -> Vec<uuid::Uuid> {
    let mut tasks = Vec::new();
    for _ in 0..workers {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(item) = queue.claim_next(Utc::now()).await.unwrap() {
                claimed.push(item.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    all
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_an_item() {
    let queue = Arc::new(InMemoryWorkItemQueue::new());
    for i in 0..50 {
        queue
            .enqueue(NewWorkItem::builder().kind("echo").payload(json!({ "n": i })).build())
            .await
            .unwrap();
    }

    let claimed = claim_concurrently(queue.clone(), 8).await;

    assert_eq!(claimed.len(), 50);
    assert_eq!(claimed.iter().collect::<HashSet<_>>().len(), 50);
    assert!(queue
        .all()
        .iter()
        .all(|item| item.status == WorkItemStatus::Running && item.attempts == 0));
}

#[tokio::test]
async fn always_failing_item_ends_failed_after_max_attempts() {
    let queue = Arc::new(InMemoryWorkItemQueue::new());
    let id = queue
        .enqueue(
            NewWorkItem::builder()
                .kind("flaky")
                .payload(json!({ "note": "x" }))
                .max_attempts(2)
                .build(),
        )
        .await
        .unwrap();

    let runner = always_failing_runner(queue.clone());
    assert_eq!(runner.run_until_idle().await.unwrap(), 2);

    let item = queue.find(id).await.unwrap().unwrap();
    assert_eq!(item.status, WorkItemStatus::Failed);
    assert_eq!(item.attempts, 2);
    assert!(item.finished_at.is_some());
    assert!(item.last_error.unwrap().contains("upstream unavailable"));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn postgres_queue_lifecycle(ctx: &TestHarness) {
    let queue: Arc<dyn WorkItemQueue> = Arc::new(PostgresWorkItemQueue::new(ctx.db_pool.clone()));

    // SKIP LOCKED: concurrent claimers split the queue between them.
    for i in 0..20 {
        queue
            .enqueue(NewWorkItem::builder().kind("echo").payload(json!({ "n": i })).build())
            .await
            .unwrap();
    }
    let claimed = claim_concurrently(queue.clone(), 4).await;
    assert_eq!(claimed.len(), 20);
    assert_eq!(claimed.iter().collect::<HashSet<_>>().len(), 20);
    for id in &claimed {
        assert!(queue.mark_done(*id, Utc::now()).await.unwrap());
    }
    assert!(!queue.mark_done(claimed[0], Utc::now()).await.unwrap());

    // Future items stay put.
    let later = queue
        .enqueue(
            NewWorkItem::builder()
                .kind("echo")
                .available_at(Utc::now() + chrono::Duration::hours(1))
                .build(),
        )
        .await
        .unwrap();
    assert!(queue.claim_next(Utc::now()).await.unwrap().is_none());

    // A non-retryable failure is terminal on the first attempt.
    let item = queue
        .claim_next(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.id, later);
    let failed = queue
        .mark_failed(item.id, "bad payload", FailureKind::NonRetryable, Utc::now(), Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, WorkItemStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("bad payload"));

    // Retries exhaust max_attempts.
    let id = queue
        .enqueue(
            NewWorkItem::builder()
                .kind("flaky")
                .payload(json!({ "note": "x" }))
                .max_attempts(2)
                .build(),
        )
        .await
        .unwrap();
    let processed = always_failing_runner(queue.clone())
        .run_until_idle()
        .await
        .unwrap();
    assert_eq!(processed, 2);
    let item = queue.find(id).await.unwrap().unwrap();
    assert_eq!(item.status, WorkItemStatus::Failed);
    assert_eq!(item.attempts, 2);
    assert!(item.last_error.unwrap().contains("upstream unavailable"));

    // A crashed worker's item comes back through requeue_stale.
    let id = queue
        .enqueue(NewWorkItem::builder().kind("echo").build())
        .await
        .unwrap();
    let stuck = queue.claim_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(stuck.id, id);
    assert_eq!(
        queue
            .requeue_stale(Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        queue
            .requeue_stale(Utc::now() + chrono::Duration::seconds(1), Utc::now())
            .await
            .unwrap(),
        1
    );
    let item = queue.find(id).await.unwrap().unwrap();
    assert_eq!(item.status, WorkItemStatus::Queued);
    assert!(item.started_at.is_none());
}
