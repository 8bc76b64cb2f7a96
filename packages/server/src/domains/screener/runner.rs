//! Start/stop control over one background screening loop.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::screening::BaseScreener;
use super::service::{LoopExit, TopicScreener};
use crate::kernel::IdleBackoff;

/// How long `stop` waits for an in-flight topic before aborting the task.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl RunnerStatus {
    pub fn is_running(&self) -> bool {
        self.state == RunnerState::Running
    }
}

struct RunnerInner {
    status: RunnerStatus,
    /// Bumped on every start; a loop only reports back while it is current.
    generation: u64,
    stop: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

pub struct ScreenerRunner {
    service: Arc<TopicScreener>,
    inner: Arc<Mutex<RunnerInner>>,
    stop_timeout: Duration,
}

impl ScreenerRunner {
    pub fn new(service: Arc<TopicScreener>) -> Self {
        Self {
            service,
            inner: Arc::new(Mutex::new(RunnerInner {
                status: RunnerStatus {
                    state: RunnerState::Stopped,
                    started_at: None,
                    stopped_at: None,
                    last_error: None,
                    last_error_at: None,
                },
                generation: 0,
                stop: None,
                task: None,
            })),
            stop_timeout: STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Spawn the loop. `false` when one is already running.
    pub fn start(
        &self,
        screener: Arc<dyn BaseScreener>,
        idle_min: Duration,
        idle_max: Duration,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.status.state != RunnerState::Stopped {
            return false;
        }

        let stop = CancellationToken::new();
        inner.generation += 1;
        let generation = inner.generation;
        inner.status.state = RunnerState::Running;
        inner.status.started_at = Some(Utc::now());
        inner.status.stopped_at = None;
        inner.status.last_error = None;
        inner.status.last_error_at = None;
        inner.stop = Some(stop.clone());

        let service = self.service.clone();
        let shared = self.inner.clone();
        inner.task = Some(tokio::spawn(async move {
            let backoff = IdleBackoff::new(idle_min, idle_max);
            let outcome = AssertUnwindSafe(service.run_loop(screener.as_ref(), &stop, backoff))
                .catch_unwind()
                .await;

            let mut inner = shared.lock().unwrap_or_else(|e| e.into_inner());
            if inner.generation != generation {
                return;
            }
            let error = match outcome {
                Ok(LoopExit::Stopped) => None,
                Ok(LoopExit::QuotaExceeded(msg)) => Some(format!("quota exceeded: {}", msg)),
                Err(_) => Some("screener loop panicked".to_string()),
            };
            if let Some(error) = error {
                warn!(%error, "screener loop ended with an error");
                inner.status.last_error = Some(error);
                inner.status.last_error_at = Some(Utc::now());
            }
            inner.status.state = RunnerState::Stopped;
            inner.status.stopped_at = Some(Utc::now());
            inner.stop = None;
            inner.task = None;
        }));

        info!(?idle_min, ?idle_max, "screener runner started");
        true
    }

    /// Signal the loop and wait for it to finish its current topic. `false`
    /// when nothing is running.
    pub async fn stop(&self) -> bool {
        let task = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.status.state != RunnerState::Running {
                return false;
            }
            inner.status.state = RunnerState::Stopping;
            if let Some(stop) = inner.stop.take() {
                stop.cancel();
            }
            inner.task.take()
        };

        if let Some(mut task) = task {
            match tokio::time::timeout(self.stop_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "screener task failed"),
                Err(_) => {
                    warn!("screener loop did not stop in time, aborting it");
                    task.abort();
                    if let Err(e) = task.await {
                        if !e.is_cancelled() {
                            warn!(error = %e, "screener task failed");
                        }
                    }
                }
            }
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.status.state = RunnerState::Stopped;
        if inner.status.stopped_at.is_none() {
            inner.status.stopped_at = Some(Utc::now());
        }
        info!("screener runner stopped");
        true
    }

    pub fn status(&self) -> RunnerStatus {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::screener::models::{NewTopic, TopicStatus};
    use crate::domains::screener::service::PreFilter;
    use crate::domains::screener::store::InMemoryTopicStore;
    use crate::domains::screener::screening::{ScreeningDecision, ScreeningError};
    use crate::domains::screener::testing::{MockScreener, MockVerdict};
    use async_trait::async_trait;

    const FAST: Duration = Duration::from_millis(5);

    fn runner_over(store: &Arc<InMemoryTopicStore>) -> ScreenerRunner {
        ScreenerRunner::new(Arc::new(TopicScreener::new(store.clone(), PreFilter::default())))
    }

    async fn wait_until_stopped(runner: &ScreenerRunner) {
        for _ in 0..200 {
            if !runner.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("runner never stopped");
    }

    #[tokio::test]
    async fn start_and_stop_are_exclusive() {
        let store = Arc::new(InMemoryTopicStore::new());
        let runner = runner_over(&store);

        assert!(!runner.stop().await);
        assert!(runner.start(Arc::new(MockScreener::claiming()), FAST, FAST));
        assert!(!runner.start(Arc::new(MockScreener::claiming()), FAST, FAST));
        assert!(runner.is_running());

        assert!(runner.stop().await);
        let status = runner.status();
        assert_eq!(status.state, RunnerState::Stopped);
        assert!(status.started_at.is_some());
        assert!(status.stopped_at.is_some());
        assert!(status.last_error.is_none());

        assert!(runner.start(Arc::new(MockScreener::claiming()), FAST, FAST));
        assert!(runner.stop().await);
    }

    /// Never answers within a test's lifetime.
    struct HangingScreener;

    #[async_trait]
    impl BaseScreener for HangingScreener {
        async fn classify(
            &self,
            _title: &str,
            _summary: Option<&str>,
        ) -> Result<ScreeningDecision, ScreeningError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ScreeningDecision::claim(50, "too late"))
        }
    }

    #[tokio::test]
    async fn stuck_loop_is_aborted_and_restart_stays_controllable() {
        let store = Arc::new(InMemoryTopicStore::new());
        store.insert(NewTopic::builder().title("a long enough title").build());
        let runner = runner_over(&store).with_stop_timeout(Duration::from_millis(50));

        assert!(runner.start(Arc::new(HangingScreener), FAST, FAST));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(runner.stop().await);
        assert_eq!(runner.status().state, RunnerState::Stopped);

        assert!(runner.start(Arc::new(MockScreener::claiming()), FAST, FAST));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runner.is_running());
        assert_eq!(store.with_status(TopicStatus::Claimed).len(), 1);

        assert!(runner.stop().await);
        assert_eq!(runner.status().state, RunnerState::Stopped);
        assert!(runner.status().last_error.is_none());
    }

    #[tokio::test]
    async fn quota_stop_is_reported() {
        let store = Arc::new(InMemoryTopicStore::new());
        store.insert(NewTopic::builder().title("a long enough title").build());
        let runner = runner_over(&store);

        runner.start(
            Arc::new(MockScreener::new(vec![MockVerdict::Quota("429".into())])),
            FAST,
            FAST,
        );
        wait_until_stopped(&runner).await;

        let status = runner.status();
        assert_eq!(status.state, RunnerState::Stopped);
        assert_eq!(status.last_error.as_deref(), Some("quota exceeded: 429"));
        assert!(status.last_error_at.is_some());
        assert_eq!(store.with_status(TopicStatus::New).len(), 1);
        assert!(!runner.stop().await);
    }
}
