//! Work-item runner: the worker loop of the queue.
//!
//! ```text
//! WorkItemRunner
//!     │
//!     ├─► claim_next (skip-locked)        nothing? sleep poll_interval
//!     ├─► WorkItemRegistry::execute (deserialize + call handler)
//!     └─► mark_done / mark_failed (retry with backoff or fail for good)
//! ```
//!
//! Handler errors never escape the loop; they are stored on the row. Errors
//! from the queue itself fail that iteration only and the loop polls again.
//!
//! Items left `running` by a crashed worker stay that way until an operator
//! calls [`WorkItemQueue::requeue_stale`]; there is no lease reaper.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::WorkItemQueue;
use super::registry::{DispatchError, SharedWorkItemRegistry};
use super::work_item::WorkItemStatus;
use crate::kernel::backoff::RetryPolicy;
use crate::kernel::ServerDeps;

/// Configuration for the work-item runner.
#[derive(Debug, Clone)]
pub struct WorkItemRunnerConfig {
    /// How long to wait when no item is eligible
    pub poll_interval: Duration,
    /// Delay before a failed item becomes eligible again
    pub retry_policy: RetryPolicy,
    /// Worker ID for this instance (logging only)
    pub worker_id: String,
}

impl Default for WorkItemRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            retry_policy: RetryPolicy::default(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

pub struct WorkItemRunner {
    queue: Arc<dyn WorkItemQueue>,
    registry: SharedWorkItemRegistry,
    deps: Arc<ServerDeps>,
    config: WorkItemRunnerConfig,
}

impl WorkItemRunner {
    pub fn new(
        queue: Arc<dyn WorkItemQueue>,
        registry: SharedWorkItemRegistry,
        deps: Arc<ServerDeps>,
        config: WorkItemRunnerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            deps,
            config,
        }
    }

    /// Claim and process at most one item. Returns whether anything was
    /// claimed.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(item) = self.queue.claim_next(Utc::now()).await? else {
            return Ok(false);
        };

        debug!(
            work_item_id = %item.id,
            kind = %item.kind,
            attempt = item.attempts + 1,
            worker_id = %self.config.worker_id,
            "claimed work item"
        );

        // A panicking handler is a retryable failure, not a dead worker.
        let outcome = AssertUnwindSafe(self.registry.execute(&item, self.deps.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(DispatchError::Handler(anyhow::anyhow!(
                    "work item handler panicked"
                )))
            });

        match outcome {
            Ok(()) => {
                if self.queue.mark_done(item.id, Utc::now()).await? {
                    info!(work_item_id = %item.id, kind = %item.kind, "work item done");
                } else {
                    warn!(work_item_id = %item.id, "work item was no longer running when it finished");
                }
            }
            Err(e) => {
                let attempts = (item.attempts + 1).max(0) as u32;
                let delay = self.config.retry_policy.delay(attempts);
                let now = Utc::now();
                let retry_at =
                    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::days(1));

                let updated = self
                    .queue
                    .mark_failed(item.id, &e.error_text(), e.failure_kind(), retry_at, now)
                    .await?;

                match updated {
                    Some(updated) if updated.status == WorkItemStatus::Failed => {
                        error!(
                            work_item_id = %item.id,
                            kind = %item.kind,
                            attempts = updated.attempts,
                            error = %e,
                            "work item failed permanently"
                        );
                    }
                    Some(updated) => {
                        warn!(
                            work_item_id = %item.id,
                            kind = %item.kind,
                            attempts = updated.attempts,
                            retry_at = %updated.available_at,
                            error = %e,
                            "work item failed, will retry"
                        );
                    }
                    None => {
                        warn!(work_item_id = %item.id, "work item was no longer running when it failed");
                    }
                }
            }
        }

        Ok(true)
    }

    /// Process items until none is eligible. Returns how many were claimed.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Poll until `shutdown` is cancelled. The current item always finishes;
    /// the idle sleep is cut short by cancellation.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            kinds = ?self.registry.kinds(),
            "work item runner starting"
        );

        while !shutdown.is_cancelled() {
            let claimed = match self.run_once().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "work item iteration failed");
                    false
                }
            };

            if claimed {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "work item runner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{InMemoryWorkItemQueue, NewWorkItem, WorkItemRegistry};
    use crate::kernel::TestDependencies;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Echo {
        n: i64,
    }

    fn runner(queue: Arc<InMemoryWorkItemQueue>, registry: WorkItemRegistry) -> WorkItemRunner {
        let deps = TestDependencies::new().into_deps();
        WorkItemRunner::new(
            queue,
            Arc::new(registry),
            Arc::new(deps),
            WorkItemRunnerConfig {
                poll_interval: Duration::from_millis(10),
                retry_policy: RetryPolicy::Fixed(Duration::ZERO),
                worker_id: "test-worker".into(),
            },
        )
    }

    #[tokio::test]
    async fn successful_item_is_done() {
        let queue = Arc::new(InMemoryWorkItemQueue::new());
        let mut registry = WorkItemRegistry::new();
        registry.register::<Echo, _, _>("echo", |payload, _deps| async move {
            anyhow::ensure!(payload.n == 3);
            Ok(())
        });
        let id = queue
            .enqueue(NewWorkItem::builder().kind("echo").payload(json!({ "n": 3 })).build())
            .await
            .unwrap();

        let runner = runner(queue.clone(), registry);
        assert!(runner.run_once().await.unwrap());
        assert!(!runner.run_once().await.unwrap());

        let item = queue.find(id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Done);
        assert_eq!(item.attempts, 0);
    }

    #[tokio::test]
    async fn failing_item_exhausts_its_attempts() {
        let queue = Arc::new(InMemoryWorkItemQueue::new());
        let mut registry = WorkItemRegistry::new();
        registry.register::<Echo, _, _>("echo", |_payload, _deps| async move {
            Err::<(), _>(anyhow::anyhow!("handler always fails"))
        });
        let id = queue
            .enqueue(
                NewWorkItem::builder()
                    .kind("echo")
                    .payload(json!({ "n": 3 }))
                    .max_attempts(2)
                    .build(),
            )
            .await
            .unwrap();

        let processed = runner(queue.clone(), registry).run_until_idle().await.unwrap();
        assert_eq!(processed, 2);

        let item = queue.find(id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Failed);
        assert_eq!(item.attempts, 2);
        assert!(item.last_error.unwrap().contains("handler always fails"));
    }

    #[tokio::test]
    async fn panicking_handler_is_retried_and_the_loop_survives() {
        let queue = Arc::new(InMemoryWorkItemQueue::new());
        let mut registry = WorkItemRegistry::new();
        registry.register::<Echo, _, _>("boom", |payload, _deps| async move {
            if payload.n == 3 {
                panic!("handler blew up");
            }
            Ok(())
        });
        let id = queue
            .enqueue(
                NewWorkItem::builder()
                    .kind("boom")
                    .payload(json!({ "n": 3 }))
                    .max_attempts(2)
                    .build(),
            )
            .await
            .unwrap();

        let runner = Arc::new(runner(queue.clone(), registry));
        let shutdown = CancellationToken::new();
        let task = {
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runner.run(shutdown).await })
        };

        let item = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let item = queue.find(id).await.unwrap().unwrap();
                if item.status == WorkItemStatus::Failed {
                    break item;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("item should fail after its attempts");

        assert_eq!(item.attempts, 2);
        assert!(item.last_error.unwrap().contains("panicked"));
        assert!(!task.is_finished());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_kind_fails_on_first_attempt() {
        let queue = Arc::new(InMemoryWorkItemQueue::new());
        let id = queue
            .enqueue(NewWorkItem::builder().kind("nope").build())
            .await
            .unwrap();

        let processed = runner(queue.clone(), WorkItemRegistry::new())
            .run_until_idle()
            .await
            .unwrap();
        assert_eq!(processed, 1);

        let item = queue.find(id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Failed);
        assert_eq!(item.attempts, 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let queue = Arc::new(InMemoryWorkItemQueue::new());
        let runner = runner(queue, WorkItemRegistry::new());
        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), runner.run(shutdown))
            .await
            .expect("runner should stop")
            .unwrap();
    }

    #[test]
    fn config_defaults() {
        let config = WorkItemRunnerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.retry_policy, RetryPolicy::default());
    }
}
