//! Content pipeline: series producer -> plan_next -> write_and_post.

mod common;

use std::sync::Arc;
use std::time::Duration;

use autopost_core::domains::content::{
    enqueue_due_series, register_content_handlers, PlanNext, Series, PLAN_NEXT, WRITE_AND_POST,
};
use autopost_core::kernel::jobs::{
    NewWorkItem, PostgresWorkItemQueue, WorkItemQueue, WorkItemRegistry, WorkItemRunner,
    WorkItemRunnerConfig, WorkItemStatus,
};
use autopost_core::kernel::test_dependencies::{MockReply, MockTextGenerator};
use autopost_core::kernel::{RetryPolicy, TestDependencies};
use chrono::Utc;
use test_context::test_context;

use crate::common::{create_test_series, TestHarness};

#[tokio::test]
async fn planned_episode_is_written_and_published() {
    let test_deps = TestDependencies::new().mock_text(MockTextGenerator::new(vec![
        MockReply::Text("TITLE: Borrowing in practice\n- shared vs mutable".into()),
        MockReply::Text("<h1>Borrowing, in practice</h1><p>Body</p>".into()),
    ]));
    let queue = test_deps.queue.clone();
    let publisher = test_deps.publisher.clone();

    let plan = PlanNext {
        series_id: 3,
        episode_no: 1,
        series_title: "Rust weekly".into(),
        seed_topic: "rust".into(),
    };
    let plan_id = queue
        .enqueue(
            NewWorkItem::builder()
                .kind(PLAN_NEXT)
                .payload(serde_json::to_value(&plan).unwrap())
                .build(),
        )
        .await
        .unwrap();

    let mut registry = WorkItemRegistry::new();
    register_content_handlers(&mut registry);
    let runner = WorkItemRunner::new(
        queue.clone(),
        Arc::new(registry),
        Arc::new(test_deps.into_deps()),
        WorkItemRunnerConfig {
            poll_interval: Duration::from_millis(10),
            retry_policy: RetryPolicy::Fixed(Duration::ZERO),
            worker_id: "content-test".into(),
        },
    );
    assert_eq!(runner.run_until_idle().await.unwrap(), 2);

    assert_eq!(queue.find(plan_id).await.unwrap().unwrap().status, WorkItemStatus::Done);
    let writes = queue.with_kind(WRITE_AND_POST);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].status, WorkItemStatus::Done);

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].title, "Borrowing, in practice");
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn producer_enqueues_each_due_series_once(ctx: &TestHarness) {
    let now = Utc::now();
    let due = create_test_series(&ctx.db_pool, "0 9 * * *", now - chrono::Duration::days(3))
        .await
        .unwrap();
    let later = create_test_series(&ctx.db_pool, "0 9 * * *", now + chrono::Duration::days(1))
        .await
        .unwrap();
    let broken = create_test_series(&ctx.db_pool, "DAILY@25", now - chrono::Duration::hours(1))
        .await
        .unwrap();

    let summary = enqueue_due_series(&ctx.db_pool, now).await.unwrap();

    // Three missed days collapse into one episode.
    let enqueued: Vec<_> = summary
        .enqueued
        .iter()
        .filter(|e| e.series_id == due.id)
        .collect();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].episode_no, 1);
    assert!(summary.enqueued.iter().all(|e| e.series_id != later.id));
    assert!(summary.invalid.iter().any(|i| i.series_id == broken.id));

    let refreshed = Series::find_by_id(due.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(refreshed.episode_count, 1);
    assert!(refreshed.next_run_at > now);

    let queue = PostgresWorkItemQueue::new(ctx.db_pool.clone());
    let item = queue.find(enqueued[0].work_item_id).await.unwrap().unwrap();
    assert_eq!(item.kind, PLAN_NEXT);
    assert_eq!(item.payload["series_id"], due.id);
    assert_eq!(item.status, WorkItemStatus::Queued);

    // Not due any more.
    let again = enqueue_due_series(&ctx.db_pool, now).await.unwrap();
    assert!(again.enqueued.iter().all(|e| e.series_id != due.id));
}
